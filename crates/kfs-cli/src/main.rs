#![forbid(unsafe_code)]

use std::env;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use kfs_core::{
    Disk, FileByteDevice, FileType, FormatOptions, FsOps, KfsError, KfsFs, MountConfig,
    RequestCtx, format, format_uuid,
};
use kfs_fuse::MountOptions;
use kfs_types::BlockSize;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chunk size for `put`.
const COPY_CHUNK: usize = 1 << 20;

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    uuid: String,
    block_size: u32,
    blocks_count: u64,
    free_blocks: u64,
    reserved_blocks: u64,
    inodes_count: u32,
    free_inodes: u32,
    groups: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    desc_size: u16,
    mnt_count: u16,
    incompat: String,
    writable: bool,
}

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("KFS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Argument handling ───────────────────────────────────────────────────────

/// Remove a boolean flag from `args`, reporting whether it was present.
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

/// Remove `--name value` from `args`.
fn take_value(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{name} requires a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn positional<const N: usize>(args: Vec<String>, usage: &str) -> Result<[String; N]> {
    if let Some(flag) = args.iter().find(|a| a.starts_with("--")) {
        bail!("unknown option {flag}; usage: {usage}");
    }
    args.try_into()
        .map_err(|_| anyhow::anyhow!("usage: {usage}"))
}

/// Byte count with an optional K, M or G suffix.
fn parse_size(text: &str) -> Result<u64> {
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'K' | b'k') => (&text[..text.len() - 1], 10),
        Some(b'M' | b'm') => (&text[..text.len() - 1], 20),
        Some(b'G' | b'g') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size {text:?}"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("size {text:?} overflows"))
}

fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || take_flag(&mut args, "--help") || take_flag(&mut args, "-h") {
        print_usage();
        return Ok(());
    }
    let command = args.remove(0);
    let config = match take_value(&mut args, "--config")? {
        Some(path) => MountConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => MountConfig::default(),
    };

    match command.as_str() {
        "mkfs" => {
            let size = take_value(&mut args, "--size")?
                .context("mkfs requires --size <bytes>")?;
            let block_size = take_value(&mut args, "--block-size")?;
            let label = take_value(&mut args, "--label")?;
            let json = take_flag(&mut args, "--json");
            let [image] = positional(args, "kfs mkfs <image> --size <bytes>")?;
            let mut opts = FormatOptions::default();
            if let Some(bs) = block_size {
                opts.block_size = bs.parse().with_context(|| format!("invalid block size {bs:?}"))?;
            }
            if let Some(label) = label {
                opts.volume_name = label;
            }
            mkfs(Path::new(&image), parse_size(&size)?, &opts, json)
        }
        "inspect" => {
            let json = take_flag(&mut args, "--json");
            let [image] = positional(args, "kfs inspect <image> [--json]")?;
            inspect(Path::new(&image), config, json)
        }
        "ls" => {
            let [image, path] = positional(args, "kfs ls <image> <path>")?;
            ls(Path::new(&image), config, &path)
        }
        "cat" => {
            let [image, path] = positional(args, "kfs cat <image> <path>")?;
            cat(Path::new(&image), config, &path)
        }
        "put" => {
            let [image, path, local] = positional(args, "kfs put <image> <path> <local-file>")?;
            put(Path::new(&image), config, &path, Path::new(&local))
        }
        "mount" => {
            let read_only = take_flag(&mut args, "--ro");
            let allow_other = take_flag(&mut args, "--allow-other");
            let [image, mountpoint] =
                positional(args, "kfs mount <image> <mountpoint> [--ro] [--allow-other]")?;
            mount_cmd(
                Path::new(&image),
                PathBuf::from(mountpoint),
                config,
                read_only,
                allow_other,
            )
        }
        "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("kfs\n");
    println!("USAGE:");
    println!("  kfs mkfs <image> --size <bytes>[K|M|G] [--block-size N] [--label NAME] [--json]");
    println!("  kfs inspect <image> [--json]");
    println!("  kfs ls <image> <path>");
    println!("  kfs cat <image> <path>");
    println!("  kfs put <image> <path> <local-file>");
    println!("  kfs mount <image> <mountpoint> [--ro] [--allow-other]");
    println!();
    println!("OPTIONS:");
    println!("  --config <file>   mount configuration (JSON)");
    println!("  KFS_LOG           log filter, default \"info\"");
}

// ── Commands ────────────────────────────────────────────────────────────────

fn open_image(image: &Path, config: MountConfig) -> Result<KfsFs> {
    KfsFs::open(image, config)
        .with_context(|| format!("failed to open filesystem image {}", image.display()))
}

fn read_only(mut config: MountConfig) -> MountConfig {
    config.read_only = true;
    config
}

fn mkfs(image: &Path, size: u64, opts: &FormatOptions, json: bool) -> Result<()> {
    let block_size = BlockSize::new(opts.block_size)
        .with_context(|| format!("unsupported block size {}", opts.block_size))?;
    let dev = FileByteDevice::create(image, size)
        .with_context(|| format!("cannot create {}", image.display()))?;
    let disk = Disk::new(Box::new(dev), block_size);
    let summary = format(&disk, opts)
        .with_context(|| format!("formatting {} failed", image.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        );
    } else {
        println!("formatted {}", image.display());
        println!("uuid: {}", summary.uuid);
        println!("block_size: {}", summary.block_size);
        println!("blocks: {} ({} free)", summary.blocks_count, summary.free_blocks);
        println!("inodes: {} ({} free)", summary.inodes_count, summary.free_inodes);
        println!("groups: {}", summary.groups);
    }
    Ok(())
}

fn inspect(image: &Path, config: MountConfig, json: bool) -> Result<()> {
    let fs = open_image(image, read_only(config))?;
    let sb = fs.superblock();
    let stats = fs.stats();
    let output = InspectOutput {
        volume_name: sb.volume_name.clone(),
        uuid: format_uuid(&sb.uuid),
        block_size: sb.block_size,
        blocks_count: sb.blocks_count,
        free_blocks: stats.free_blocks,
        reserved_blocks: sb.reserved_blocks_count,
        inodes_count: sb.inodes_count,
        free_inodes: stats.free_inodes,
        groups: sb.groups_count(),
        blocks_per_group: sb.blocks_per_group,
        inodes_per_group: sb.inodes_per_group,
        inode_size: sb.inode_size,
        desc_size: sb.desc_size,
        mnt_count: sb.mnt_count,
        incompat: sb.feature_incompat.to_string(),
        writable: sb.is_writable(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("kfs inspector");
        println!("volume_name: {}", output.volume_name);
        println!("uuid: {}", output.uuid);
        println!("block_size: {}", output.block_size);
        println!("blocks: {} ({} free)", output.blocks_count, output.free_blocks);
        println!("inodes: {} ({} free)", output.inodes_count, output.free_inodes);
        println!(
            "groups: {} ({} blocks, {} inodes each)",
            output.groups, output.blocks_per_group, output.inodes_per_group
        );
        println!("inode_size: {}", output.inode_size);
        println!("features: {}", output.incompat);
        println!("mount_count: {}", output.mnt_count);
    }
    Ok(())
}

fn kind_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::BlockDevice => 'b',
        FileType::CharDevice => 'c',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        FileType::RegularFile => '-',
    }
}

fn ls(image: &Path, config: MountConfig, path: &str) -> Result<()> {
    let fs = open_image(image, read_only(config))?;
    let ctx = RequestCtx::root();
    let attr = fs.stat(&ctx, path).with_context(|| format!("stat {path}"))?;
    if attr.kind != FileType::Directory {
        println!("{} {:>8} {:>10} {path}", kind_char(attr.kind), attr.ino.0, attr.size);
        return Ok(());
    }
    let mut out = std::io::stdout().lock();
    for entry in fs.list_dir(&ctx, path).with_context(|| format!("listing {path}"))? {
        let size = fs.getattr(entry.ino).map_or(0, |a| a.size);
        writeln!(
            out,
            "{} {:>8} {:>10} {}",
            kind_char(entry.kind),
            entry.ino.0,
            size,
            entry.name_str()
        )?;
    }
    Ok(())
}

fn cat(image: &Path, config: MountConfig, path: &str) -> Result<()> {
    let fs = open_image(image, read_only(config))?;
    let data = fs
        .read_file(&RequestCtx::root(), path)
        .with_context(|| format!("reading {path}"))?;
    std::io::stdout().lock().write_all(&data)?;
    Ok(())
}

fn put(image: &Path, config: MountConfig, path: &str, local: &Path) -> Result<()> {
    let mut src = File::open(local).with_context(|| format!("opening {}", local.display()))?;
    let fs = open_image(image, config)?;
    let ctx = RequestCtx::root();
    match fs.stat(&ctx, path) {
        Ok(attr) if attr.kind == FileType::RegularFile => {
            fs.truncate_path(&ctx, path, 0)
                .with_context(|| format!("truncating {path}"))?;
        }
        Ok(_) => bail!("{path} exists and is not a regular file"),
        Err(KfsError::NotFound(_)) => {
            fs.create_file(&ctx, path, 0o644)
                .with_context(|| format!("creating {path}"))?;
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("stat {path}"))),
    }

    let mut buf = vec![0_u8; COPY_CHUNK];
    let mut offset = 0_u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        fs.write_file(&ctx, path, offset, &buf[..n])
            .with_context(|| format!("writing {path} at offset {offset}"))?;
        offset += n as u64;
    }
    info!(path, bytes = offset, "copied");
    fs.unmount().context("final write-back")?;
    Ok(())
}

fn mount_cmd(
    image: &Path,
    mountpoint: PathBuf,
    mut config: MountConfig,
    read_only: bool,
    allow_other: bool,
) -> Result<()> {
    config.read_only |= read_only;
    let fs = open_image(image, config)?;
    let opts = MountOptions {
        read_only: fs.is_read_only(),
        allow_other,
        auto_unmount: true,
    };
    let sb = fs.superblock();
    info!(
        image = %image.display(),
        mountpoint = %mountpoint.display(),
        block_size = sb.block_size,
        blocks = sb.blocks_count,
        read_only = opts.read_only,
        "mounting"
    );

    let ops: Arc<dyn FsOps> = Arc::new(fs);
    let stats = kfs_fuse::mount(ops, &mountpoint, &opts)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    info!(
        requests = stats.requests_total,
        errors = stats.requests_err,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "session closed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("16M").unwrap(), 16 << 20);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("12X").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn options_are_removed_from_args() {
        let mut args = strings(&["img", "--size", "8M", "--json"]);
        assert!(take_flag(&mut args, "--json"));
        assert_eq!(take_value(&mut args, "--size").unwrap().as_deref(), Some("8M"));
        assert_eq!(args, strings(&["img"]));
        assert!(take_value(&mut strings(&["--size"]), "--size").is_err());
    }

    #[test]
    fn positional_rejects_leftover_flags_and_wrong_arity() {
        let [a, b] = positional::<2>(strings(&["x", "y"]), "u").unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("x", "y"));
        assert!(positional::<2>(strings(&["x"]), "u").is_err());
        assert!(positional::<1>(strings(&["x", "--bogus"]), "u").is_err());
    }

    #[test]
    fn mkfs_put_cat_roundtrip_on_file_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("img");
        let local = dir.path().join("local.txt");
        std::fs::write(&local, b"from the host\n").unwrap();

        mkfs(&image, 8 << 20, &FormatOptions::default(), true).unwrap();
        put(&image, MountConfig::default(), "/copied", &local).unwrap();

        let fs = open_image(&image, read_only(MountConfig::default())).unwrap();
        let data = fs.read_file(&RequestCtx::root(), "/copied").unwrap();
        assert_eq!(data, b"from the host\n");
    }
}
