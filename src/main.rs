//! The krypton CLI: parse flags, assemble devices and the loader, run
//! the guest until it shuts down.

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "krypton")]
#[command(about = "A minimal KVM hypervisor that boots 64-bit Linux")]
struct Args {
    /// VM memory size in MiB
    #[arg(long, default_value_t = 1024)]
    mem: u64,

    /// Load the kernel bzImage from a file or URL
    #[arg(long, default_value = "bzImage")]
    kernel: String,

    /// Load an initial ramdisk from a file or URL
    #[arg(long)]
    initrd: Option<String>,

    /// Kernel command line
    #[arg(long, default_value = "console=hvc0 reboot=t")]
    cmdline: String,

    /// Add a block device: a path, file:// or http(s):// URL, or
    /// mem:<bytes>; append :ro to force read-only (multiple OK)
    #[arg(long = "block")]
    block: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();

    if let Err(err) = run(args) {
        eprintln!("krypton: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use krypton::boot::LinuxLoader;
    use krypton::devices::virtio::block::Block;
    use krypton::devices::virtio::console::Console;
    use krypton::devices::virtio::DeviceHandler;
    use krypton::vmm::{Config, Vm};
    use std::sync::Arc;

    let kernel = read_url(&args.kernel)?;

    let initrd = match &args.initrd {
        Some(path) => Some(read_url(path)?),
        None => None,
    };

    let mut handlers: Vec<Arc<dyn DeviceHandler>> = vec![Arc::new(Console::new(
        Some(Box::new(std::io::stdin())),
        Some(Box::new(std::io::stdout())),
    ))];

    for spec in &args.block {
        let (storage, read_only) = parse_block_spec(spec)?;
        handlers.push(Arc::new(Block::new(storage, read_only)));
    }

    let vm = Vm::new(Config {
        mem_size: args.mem << 20,
        devices: handlers,
        loader: Box::new(LinuxLoader {
            kernel,
            initrd,
            cmdline: args.cmdline,
        }),
        arch: None,
    })?;

    let _term = RawTerminal::enter();

    let res = vm.run();
    vm.close()?;
    res?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("krypton requires Linux with KVM support".into())
}

/// Puts stdin into raw mode while the guest owns the console, restoring
/// canonical mode on drop.
#[cfg(target_os = "linux")]
struct RawTerminal {
    active: bool,
}

#[cfg(target_os = "linux")]
impl RawTerminal {
    fn enter() -> Self {
        use vmm_sys_util::terminal::Terminal;

        // SAFETY: querying fd 0.
        let is_tty = unsafe { libc::isatty(0) } == 1;
        let active = is_tty && std::io::stdin().lock().set_raw_mode().is_ok();

        Self { active }
    }
}

#[cfg(target_os = "linux")]
impl Drop for RawTerminal {
    fn drop(&mut self) {
        use vmm_sys_util::terminal::Terminal;

        if self.active {
            let _ = std::io::stdin().lock().set_canon_mode();
        }
    }
}

/// Read a file path or file/http(s) URL into memory.
#[cfg(target_os = "linux")]
fn read_url(s: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if s.starts_with("http://") || s.starts_with("https://") {
        let res = reqwest::blocking::get(s)?.error_for_status()?;
        return Ok(res.bytes()?.to_vec());
    }

    let path = s.strip_prefix("file://").unwrap_or(s);
    Ok(std::fs::read(path)?)
}

/// Parse a --block spec into storage plus a read-only flag.
#[cfg(target_os = "linux")]
fn parse_block_spec(
    spec: &str,
) -> Result<
    (
        std::sync::Arc<dyn krypton::devices::virtio::block::BlockStorage>,
        bool,
    ),
    Box<dyn std::error::Error>,
> {
    use krypton::devices::virtio::block::{FileStorage, HttpStorage, MemStorage};
    use std::sync::Arc;

    let (spec, ro) = match spec.strip_suffix(":ro") {
        Some(rest) => (rest, true),
        None => (spec, false),
    };

    if spec.starts_with("http://") || spec.starts_with("https://") {
        // HTTP storage can't be written no matter what the flag says.
        return Ok((Arc::new(HttpStorage::new(spec.to_string())), true));
    }

    if let Some(size) = spec.strip_prefix("mem:") {
        let size: usize = size.parse()?;
        return Ok((Arc::new(MemStorage::new(vec![0u8; size])), ro));
    }

    let path = spec.strip_prefix("file://").unwrap_or(spec);
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(!ro)
        .open(path)?;

    Ok((Arc::new(FileStorage::new(file)), ro))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use krypton::devices::virtio::block::BlockStorage;

    #[test]
    fn block_spec_mem() {
        let (storage, ro) = parse_block_spec("mem:4096").unwrap();
        assert!(!ro);
        assert_eq!(storage.size().unwrap(), 4096);
        assert!(storage.writable());

        let (_, ro) = parse_block_spec("mem:4096:ro").unwrap();
        assert!(ro);
    }

    #[test]
    fn block_spec_http_is_read_only() {
        let (storage, ro) = parse_block_spec("http://example.com/disk.img").unwrap();
        assert!(ro);
        assert!(!storage.writable());
    }

    #[test]
    fn block_spec_bad_mem_size() {
        assert!(parse_block_spec("mem:lots").is_err());
    }

    #[test]
    fn block_spec_missing_file() {
        assert!(parse_block_spec("/does/not/exist.img").is_err());
    }
}
