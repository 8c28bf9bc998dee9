//! hatchery-push - upload an application bundle to a hatchery server
//!
//! Usage:
//!   hatchery-push [options] [version-label]
//!     -h <host>    [ssh:]host to connect to (default: ssh:<app hostname>)
//!     -p <port>    admin port (default: 8888)
//!     -d <dir>     application directory (default: .)
//!     -f <file>    app config file (default: <dir>/hatchery.json)
//!
//! The app config is JSON: {"name", "hostname", "command", "env": []}.
//! The whole directory tree is streamed (dot-files skipped, symlinks
//! resolved); the server assigns the version number.

use anyhow::{bail, Context, Result};
use hatchery::wire::{
    read_json0_blocking, write_json0_blocking, Accept, AppMessage, FileMessage, Status,
};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// App config read from hatchery.json.
#[derive(Debug, Deserialize)]
struct AppConfig {
    name: String,
    hostname: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug)]
struct Options {
    host: Option<String>,
    port: String,
    app_dir: PathBuf,
    config_file: Option<PathBuf>,
    version: String,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        host: None,
        port: "8888".to_string(),
        app_dir: PathBuf::from("."),
        config_file: None,
        version: "none".to_string(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => options.host = Some(args.next().context("-h needs a value")?),
            "-p" => options.port = args.next().context("-p needs a value")?,
            "-d" => options.app_dir = PathBuf::from(args.next().context("-d needs a value")?),
            "-f" => options.config_file = Some(PathBuf::from(args.next().context("-f needs a value")?)),
            other if other.starts_with('-') => bail!("unknown option: {}", other),
            other => options.version = other.to_string(),
        }
    }
    Ok(options)
}

fn load_config(options: &Options) -> Result<AppConfig> {
    let candidates = match &options.config_file {
        Some(file) => vec![file.clone()],
        None => vec![
            options.app_dir.join("hatchery.json"),
            PathBuf::from("hatchery.json"),
        ],
    };

    for candidate in &candidates {
        match std::fs::read(candidate) {
            Ok(bytes) => {
                return serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", candidate.display()));
            }
            Err(_) => continue,
        }
    }
    bail!(
        "unable to read app config ({})",
        candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(" or ")
    )
}

/// The two transports look the same to the upload loop.
enum Transport {
    Tcp {
        reader: TcpStream,
        writer: TcpStream,
    },
    Ssh {
        _child: Child,
        stdin: std::process::ChildStdin,
        stdout: std::process::ChildStdout,
    },
}

impl Transport {
    fn split(&mut self) -> (&mut dyn Read, &mut dyn Write) {
        match self {
            Transport::Tcp { reader, writer } => (reader, writer),
            Transport::Ssh { stdin, stdout, .. } => (stdout, stdin),
        }
    }
}

fn dial(host: &str, port: &str) -> Result<Transport> {
    if let Some(ssh_host) = host
        .strip_prefix("ssh://")
        .or_else(|| host.strip_prefix("ssh:"))
        .or_else(|| host.starts_with("ssh").then_some(host))
    {
        // Tunnel the admin port through ssh -W; stderr is relayed so
        // password prompts still reach the terminal.
        let mut child = Command::new("ssh")
            .arg(format!("-Wlocalhost:{}", port))
            .arg(ssh_host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning ssh")?;

        let stdin = child.stdin.take().context("ssh stdin")?;
        let stdout = child.stdout.take().context("ssh stdout")?;
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    eprintln!("> {}", line);
                }
            });
        }

        let mut transport = Transport::Ssh {
            _child: child,
            stdin,
            stdout,
        };
        // A NUL prelude flushes anything the channel injects; the server
        // skips leading NULs.
        let (_, writer) = transport.split();
        writer.write_all(&[0, 0, 0, 0])?;
        return Ok(transport);
    }

    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };
    let stream = TcpStream::connect(&addr).with_context(|| format!("connecting to {}", addr))?;
    let reader = stream.try_clone().context("cloning connection")?;
    Ok(Transport::Tcp { reader, writer: stream })
}

/// Stream a directory tree: directories first, then their contents.
/// Dot-files are skipped; symlinks count as whatever they point at.
fn send_files(dir: &Path, sub: &Path, writer: &mut dyn Write) -> Result<(u64, u64)> {
    let mut file_count = 0;
    let mut byte_count = 0;

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with('.') {
            continue;
        }

        let full_path = dir.join(&name);
        // fs::metadata follows symlinks, classifying them by target.
        let Ok(metadata) = std::fs::metadata(&full_path) else {
            eprintln!("skipping unreadable entry: {}", full_path.display());
            continue;
        };

        let rel = sub.join(&name);
        if metadata.is_dir() {
            let message = FileMessage {
                name: format!("{}/", rel.display()),
                size: 0,
                perm: 0,
            };
            write_json0_blocking(writer, &message)?;
            let (files, bytes) = send_files(&full_path, &rel, writer)?;
            file_count += files;
            byte_count += bytes;
            continue;
        }
        if !metadata.is_file() {
            eprintln!("skipping non-file: {}", full_path.display());
            continue;
        }

        let contents = std::fs::read(&full_path)
            .with_context(|| format!("reading {}", full_path.display()))?;
        let message = FileMessage {
            name: rel.display().to_string(),
            size: contents.len() as i64,
            perm: 0,
        };
        write_json0_blocking(writer, &message)?;
        writer.write_all(&contents)?;
        file_count += 1;
        byte_count += contents.len() as u64;
    }
    Ok((file_count, byte_count))
}

fn main() -> Result<()> {
    let options = parse_args()?;
    let config = load_config(&options)?;

    let host = options
        .host
        .clone()
        .unwrap_or_else(|| format!("ssh:{}", config.hostname));

    println!(
        "uploading app: {} version: {} to: {}",
        config.name, options.version, host
    );

    let mut transport = dial(&host, &options.port)?;
    let (reader, writer) = transport.split();
    let mut reader = BufReader::new(reader);

    let app = AppMessage {
        name: config.name.clone(),
        version: options.version.clone(),
        command: config.command.clone(),
        hosts: vec![config.hostname.clone()],
        env: config.env.clone(),
        tls: false,
        lets_encrypt_mail: String::new(),
        https_only: false,
    };
    write_json0_blocking(writer, &app)?;

    let accept: Accept = read_json0_blocking(&mut reader)?;
    println!("uploading app: {} as: {}", config.name, accept.id);

    let (files, bytes) = send_files(&options.app_dir, Path::new(""), writer)?;
    write_json0_blocking(writer, &FileMessage::end())?;
    println!("uploaded files: {}, total bytes: {}", files, bytes);

    let status: Status = read_json0_blocking(&mut reader)?;
    if !status.ok {
        bail!("upload rejected: {}", status.msg);
    }
    println!("ok: version {}", accept.version);
    Ok(())
}
