#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use volstore::Volume;

#[derive(Arbitrary, Debug)]
enum Op {
    Put { name: String, size: u16 },
    Mkdir { name: String },
    Rm { name: String },
    Rmdir { name: String },
    Edit { name: String, size: u16 },
    Rename { old: String, new: String },
    Cd { name: String },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut vol = match Volume::new(32 * 1024) {
        Ok(vol) => vol,
        Err(_) => return,
    };

    for op in ops {
        let _ = match op {
            Op::Put { name, size } => vol.put(&name, &vec![0xA5; size as usize]).map(|_| ()),
            Op::Mkdir { name } => vol.mkdir(&name).map(|_| ()),
            Op::Rm { name } => vol.rm(&name),
            Op::Rmdir { name } => vol.rmdir(&name),
            Op::Edit { name, size } => vol.edit(&name, &vec![0x5A; size as usize]),
            Op::Rename { old, new } => vol.rename(&old, &new),
            Op::Cd { name } => vol.cd(&name),
        };
        vol.check_invariants().unwrap();
    }
});
