//! Demonstration driver: boots the model kernel, gives a root process some
//! memory, forks it a few times and shows that every child sees the
//! parent's memory while its writes stay private.

mod logger;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use exokern::{Kernel, KernelConfig, Process};
use libexo::memlayout::{PGSIZE, UTEXT};
use libexo::{EnvId, ForkResult, PteFlags, Runtime, Syscalls, PERM_RW};
use log::LevelFilter;
use x86_64::VirtAddr;

/// Fork a process copy-on-write on top of an exokernel model.
#[derive(Parser, Debug)]
#[command(name = "exofork", version)]
struct Args {
    /// Number of children to fork from the root process
    #[arg(long, default_value_t = 3)]
    children: usize,

    /// Physical pages available to the kernel
    #[arg(long, default_value_t = 4096)]
    frames: usize,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

const GREETING: &[u8] = b"hello from the parent";

fn os(e: libexo::Error) -> anyhow::Error {
    anyhow!("kernel call failed: {}", e)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level: LevelFilter = args
        .log_level
        .parse()
        .map_err(|_| anyhow!("unknown log level '{}'", args.log_level))?;
    logger::init(level)?;

    let kernel = Kernel::new(KernelConfig::default().max_frames(args.frames));
    let root = kernel
        .spawn()
        .map_err(|e| anyhow!("cannot start root process: {}", e))?;
    let data = VirtAddr::new(UTEXT);
    let rodata = VirtAddr::new(UTEXT + PGSIZE);

    root.page_alloc(EnvId::SELF, data, PERM_RW).map_err(os)?;
    root.write(data, GREETING)?;
    root.page_alloc(EnvId::SELF, rodata, PERM_RW).map_err(os)?;
    root.write(rodata, b"constant")?;
    let read_only = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
    root.page_map(EnvId::SELF, rodata, EnvId::SELF, rodata, read_only)
        .map_err(os)?;

    let mut rt = Runtime::bootstrap(root.clone());
    for n in 0..args.children {
        let child = match rt.fork().map_err(os)? {
            ForkResult::Parent(child) => child,
            ForkResult::Child => bail!("root process resumed as a child"),
        };
        let handle = kernel
            .process(child)
            .with_context(|| format!("child {} is not runnable", child))?;
        run_child(rt.duplicate_for(handle), n, data)?;
    }

    let seen = root.read(data, GREETING.len())?;
    println!(
        "parent {} still reads {:?}",
        root.id(),
        String::from_utf8_lossy(&seen)
    );
    if seen != GREETING {
        bail!("a child's write leaked into the parent");
    }
    println!(
        "{} of {} pages in use; {}",
        kernel.frames_in_use(),
        kernel.config().max_frames,
        kernel.stats()
    );
    Ok(())
}

/// What each child does once scheduled: confirm it is the child, read the
/// inherited data and overwrite it.
fn run_child(mut rt: Runtime<Process>, n: usize, data: VirtAddr) -> Result<()> {
    if rt.fork().map_err(os)? != ForkResult::Child {
        bail!("child did not resume inside fork");
    }
    let me = rt.sys().clone();
    let inherited = me.read(data, GREETING.len())?;
    let note = format!("child {} wrote this", n);
    me.write(data, note.as_bytes())?;
    let after = me.read(data, note.len())?;
    println!(
        "child {} ({}) inherited {:?}, now reads {:?}",
        n,
        rt.thisenv(),
        String::from_utf8_lossy(&inherited),
        String::from_utf8_lossy(&after)
    );
    Ok(())
}
