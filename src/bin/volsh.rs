//! volsh - interactive shell over a volume image
//!
//! Loads (or formats) a volume, runs commands read from stdin, and saves the
//! image on `exit`.

use anyhow::{bail, Context};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use volstore::validation::normalize_image_path;
use volstore::{EntryKind, ImageCodec, Volume, VolumeBuilder, VolumeConfig};

/// Line that ends text input for `create` and `edit`
const TEXT_TERMINATOR: &str = ".";

#[derive(Parser, Debug)]
#[command(name = "volsh")]
#[command(about = "Interactive shell for single-volume file store images")]
struct Args {
    /// Image file to load and save (".img" is added when missing)
    image: PathBuf,

    /// Format a new partition instead of loading; give a size as `--new=BYTES`
    #[arg(
        short = 'n',
        long = "new",
        value_name = "BYTES",
        num_args = 0..=1,
        require_equals = true
    )]
    new_size: Option<Option<usize>>,

    /// First arena block of a newly formatted partition
    #[arg(long, default_value = "0")]
    offset: usize,

    /// TOML file with volume settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Passphrase for loading and saving (prompted for when needed)
    #[arg(short, long)]
    passphrase: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let config = match &args.config {
        Some(path) => VolumeConfig::load(path)
            .with_context(|| format!("failed to read config {:?}", path))?,
        None => VolumeConfig::default(),
    };

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();

    let codec = ImageCodec::new(config.clone());
    let image = normalize_image_path(&args.image);
    let mut passphrase = args.passphrase.clone();

    let volume = match args.new_size {
        Some(size) => {
            let size = size.unwrap_or(config.default_partition_size);
            let volume = VolumeBuilder::new()
                .partition_size(size)
                .storage_offset(args.offset)
                .config(config.clone())
                .build()
                .context("failed to format partition")?;
            writeln!(out, "partition size = {}", size)?;
            writeln!(out, "Make new partition successful!")?;
            print_help(&mut out)?;
            volume
        }
        None => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("failed to read image {:?}", image))?;
            load_image(&codec, &bytes, &mut passphrase, &mut input, &mut out)?
        }
    };

    info!("Volume ready: {}", image.display());
    let mut shell = Shell {
        volume,
        codec,
        image,
        passphrase,
    };
    shell.run(&mut input, &mut out)
}

/// Load an image, prompting for a passphrase unless one was given
fn load_image(
    codec: &ImageCodec,
    bytes: &[u8],
    passphrase: &mut Option<String>,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> anyhow::Result<Volume> {
    if let Some(given) = passphrase.as_deref() {
        return Ok(codec.load(bytes, Some(given))?);
    }

    let attempts = codec.config().passphrase_attempts;
    let mut accepted = None;
    let volume = codec.load_with_prompt(bytes, attempts, |attempt| {
        let _ = write!(out, "Passphrase (attempt {} of {}): ", attempt, attempts);
        let _ = out.flush();
        let line = read_line(input).ok().flatten()?;
        accepted = Some(line.clone());
        Some(line)
    })?;

    // Keep the passphrase so the image is saved the way it was loaded
    if ImageCodec::is_obfuscated(bytes)? {
        *passphrase = accepted;
    }
    Ok(volume)
}

enum Flow {
    Continue,
    Exit,
}

struct Shell {
    volume: Volume,
    codec: ImageCodec,
    image: PathBuf,
    passphrase: Option<String>,
}

impl Shell {
    fn run(&mut self, input: &mut impl BufRead, out: &mut impl Write) -> anyhow::Result<()> {
        loop {
            write!(out, "{}$ ", self.volume.current_path())?;
            out.flush()?;

            let Some(line) = read_line(input)? else {
                // End of input saves like `exit`
                self.save(out)?;
                return Ok(());
            };

            match self.execute(&line, input, out) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return Ok(()),
                Err(err) => writeln!(out, "Error: {}", err)?,
            }
        }
    }

    fn execute(
        &mut self,
        line: &str,
        input: &mut impl BufRead,
        out: &mut impl Write,
    ) -> anyhow::Result<Flow> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(Flow::Continue);
        };
        let args: Vec<&str> = words.collect();
        debug!("Command: {} {:?}", command, args);

        match command {
            "ls" => {
                for info in self.volume.ls() {
                    match info.kind {
                        EntryKind::Directory => writeln!(out, "{}/", info.name)?,
                        EntryKind::File => writeln!(out, "{}\t{}", info.name, info.size)?,
                    }
                }
            }
            "cd" => self.volume.cd(arg(&args, 0, "cd <dir>")?)?,
            "mkdir" => {
                let name = arg(&args, 0, "mkdir <name>")?;
                self.volume.mkdir(name)?;
                writeln!(out, "Directory '{}' created.", name)?;
            }
            "rmdir" => {
                let name = arg(&args, 0, "rmdir <name>")?;
                self.volume.rmdir(name)?;
                writeln!(out, "Directory '{}' removed.", name)?;
            }
            "put" => {
                let host = Path::new(arg(&args, 0, "put <host-file> [name]")?);
                let name = match args.get(1) {
                    Some(name) => name.to_string(),
                    None => host
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .context("host path has no file name")?,
                };
                let bytes = std::fs::read(host)
                    .with_context(|| format!("failed to read {:?}", host))?;
                self.volume.put(&name, &bytes)?;
                writeln!(out, "Stored '{}' ({} bytes).", name, bytes.len())?;
            }
            "get" => {
                let name = arg(&args, 0, "get <name> [host-file]")?;
                let host = PathBuf::from(args.get(1).copied().unwrap_or(name));
                let bytes = self.volume.read_all(name)?;
                std::fs::write(&host, &bytes)
                    .with_context(|| format!("failed to write {:?}", host))?;
                writeln!(out, "Wrote {} bytes to {:?}.", bytes.len(), host)?;
            }
            "cat" => {
                let bytes = self.volume.read_all(arg(&args, 0, "cat <name>")?)?;
                writeln!(out, "{}", String::from_utf8_lossy(&bytes))?;
            }
            "rm" => {
                let name = arg(&args, 0, "rm <name>")?;
                self.volume.rm(name)?;
                writeln!(out, "File '{}' removed.", name)?;
            }
            "mv" => {
                let old = arg(&args, 0, "mv <old> <new>")?;
                let new = arg(&args, 1, "mv <old> <new>")?;
                self.volume.rename(old, new)?;
            }
            "create" | "edit" => {
                let name = arg(&args, 0, "create|edit <name>")?;
                writeln!(
                    out,
                    "Enter text, end with a line containing only '{}':",
                    TEXT_TERMINATOR
                )?;
                let text = read_text(input)?;
                if command == "create" {
                    self.volume.create(name, text.as_bytes())?;
                } else {
                    self.volume.edit(name, text.as_bytes())?;
                }
            }
            "status" => writeln!(out, "{}", self.volume.status())?,
            "bitmap" => writeln!(out, "{}", self.volume.allocator())?,
            "help" => print_help(out)?,
            "exit" => {
                self.save(out)?;
                return Ok(Flow::Exit);
            }
            other => writeln!(
                out,
                "Unknown command: '{}'. Type 'help' for a list of commands.",
                other
            )?,
        }

        Ok(Flow::Continue)
    }

    fn save(&self, out: &mut impl Write) -> anyhow::Result<()> {
        if let Err(err) = self.volume.check_invariants() {
            warn!("Saving a volume that fails its checks: {}", err);
        }
        let path = self
            .codec
            .save_to_file(&self.volume, &self.image, self.passphrase.as_deref())
            .with_context(|| format!("failed to save image {:?}", self.image))?;
        writeln!(out, "Saved to {}.", path.display())?;
        Ok(())
    }
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &str) -> anyhow::Result<&'a str> {
    match args.get(index) {
        Some(value) => Ok(*value),
        None => bail!("usage: {}", usage),
    }
}

/// Read one line without its terminator, `None` at end of input
fn read_line(input: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

/// Read lines up to the terminator line (or end of input)
fn read_text(input: &mut impl BufRead) -> io::Result<String> {
    let mut text = String::new();
    while let Some(line) = read_line(input)? {
        if line == TEXT_TERMINATOR {
            break;
        }
        text.push_str(&line);
        text.push('\n');
    }
    Ok(text)
}

fn print_help(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "List of commands:")?;
    writeln!(out, "'ls'     list directory")?;
    writeln!(out, "'cd'     change directory")?;
    writeln!(out, "'rm'     remove file")?;
    writeln!(out, "'mkdir'  make directory")?;
    writeln!(out, "'rmdir'  remove empty directory")?;
    writeln!(out, "'put'    put host file into the space")?;
    writeln!(out, "'get'    get file from the space")?;
    writeln!(out, "'cat'    show content")?;
    writeln!(out, "'create' create file from typed text")?;
    writeln!(out, "'edit'   replace file content with typed text")?;
    writeln!(out, "'mv'     rename entry")?;
    writeln!(out, "'status' show status of the space")?;
    writeln!(out, "'bitmap' show block usage")?;
    writeln!(out, "'help'   list commands")?;
    writeln!(out, "'exit'   exit and store image")
}
