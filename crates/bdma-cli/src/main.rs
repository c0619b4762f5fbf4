//! `bdma` — command-line interface for BlueDMA cards.
//!
//! ```text
//! USAGE:
//!   bdma enumerate                     List supported devices
//!   bdma reg-test <data> <offset>      Write then read back one control register
//!   bdma engine-test [--channel N]     Register a buffer, submit a read and a write
//!   bdma bind-vfio <pcie-addr>         Bind device to vfio-pci (root)
//!   bdma unbind-vfio <pcie-addr>       Unbind from vfio-pci (root)
//!   bdma iommu-group <pcie-addr>       Print the IOMMU group
//! ```
//!
//! `--emulated` runs `reg-test` and `engine-test` against the in-memory card.

use anyhow::{bail, Context, Result};
use bdma_chip::desc::{control, STATUS_LEN};
use bdma_chip::PAGE_SIZE;
use bdma_driver::emulated::EmulatedFunction;
use bdma_driver::wire::{StatusRecord, TransferRequest};
use bdma_driver::{DeviceManager, DriverConfig, Handle, Registry};
use clap::{Parser, Subcommand};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Size of the engine-test buffer
const ENGINE_TEST_BYTES: usize = 8192;

#[derive(Parser)]
#[command(name = "bdma", about = "BlueDMA PCIe DMA card CLI", version)]
struct Cli {
    /// Use the emulated card instead of hardware.
    #[arg(long, global = true)]
    emulated: bool,

    /// Device index from `enumerate`.
    #[arg(long, global = true, default_value_t = 0)]
    device: usize,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List supported devices.
    Enumerate,
    /// Write <data> to 32-bit word <offset> of the control window and read it back.
    RegTest {
        /// Value to write (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        data: u32,
        /// Offset in 32-bit words (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_u32)]
        offset: u32,
    },
    /// Register an 8 KiB buffer, then submit a read of its first half and a
    /// write into its second half.
    EngineTest {
        /// Channel to use.
        #[arg(long, default_value_t = 0)]
        channel: usize,
        /// Wait this long before inspecting the buffer.
        #[arg(long, default_value_t = 0)]
        settle_ms: u64,
    },
    /// Bind a device to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Unbind a device from vfio-pci and re-bind to bdma (if loaded).
    UnbindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a device.
    IommuGroup {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::RegTest { data, offset } => {
            let registry = attach(cli.emulated, cli.device)?;
            cmd_reg_test(&registry, data, offset)?;
        }
        Cmd::EngineTest { channel, settle_ms } => {
            let registry = attach(cli.emulated, cli.device)?;
            cmd_engine_test(&registry, channel, Duration::from_millis(settle_ms))?;
        }
        Cmd::BindVfio { pcie_addr } => cmd_bind_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => cmd_unbind_vfio(&pcie_addr)?,
        Cmd::IommuGroup { pcie_addr } => cmd_iommu_group(&pcie_addr)?,
    }

    Ok(())
}

/// Accept decimal or 0x-prefixed hex, like `strtoul(.., 0)`.
fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

/// Bring up one card and attach it as device 0 of a fresh registry.
fn attach(emulated: bool, index: usize) -> Result<Registry> {
    let config = DriverConfig::from_env();
    let registry = Registry::new();
    if emulated {
        registry.probe(Arc::new(EmulatedFunction::new()), config)?;
    } else {
        let mgr = DeviceManager::discover()?;
        let info = mgr.device(index)?;
        if !info.is_vfio_bound() {
            bail!(
                "{} is not bound to vfio-pci; run `bdma bind-vfio {}` first",
                info.pcie_address(),
                info.pcie_address()
            );
        }
        let device = mgr
            .open(index, config)
            .with_context(|| format!("bringing up {}", info.pcie_address()))?;
        registry.attach(device);
    }
    Ok(registry)
}

fn cmd_enumerate() -> Result<()> {
    let mgr = DeviceManager::discover()?;

    println!("BlueDMA devices: {}", mgr.device_count());
    println!();

    for info in mgr.devices() {
        println!(
            "[{}] {:04x}:{:04x} @ {}",
            info.index, info.vendor, info.device, info.pcie_address()
        );
        println!(
            "     driver {}",
            info.driver.as_deref().unwrap_or("(none)")
        );
        match bdma_driver::vfio::iommu_group(info.pcie_address()) {
            Ok(group) => println!("     IOMMU group {group}"),
            Err(_) => println!("     IOMMU group (none)"),
        }
        println!();
    }

    Ok(())
}

fn cmd_reg_test(registry: &Registry, data: u32, offset: u32) -> Result<()> {
    let Handle::Control(mut h) = registry.open("bdma_control0")? else {
        bail!("bdma_control0 is not a control node");
    };

    let pos = u64::from(offset) * 4;
    h.seek(SeekFrom::Start(pos))?;
    h.write(&data.to_ne_bytes())?;
    println!("Written {data:#x} to offset {offset:#x}");

    h.seek(SeekFrom::Start(pos))?;
    let mut buf = [0u8; 4];
    h.read(&mut buf)?;
    let read = u32::from_ne_bytes(buf);
    println!("Read {read:#x} from offset {offset:#x}");

    if read != data {
        bail!("register mismatch: wrote {data:#x}, read {read:#x}");
    }
    Ok(())
}

fn cmd_engine_test(registry: &Registry, channel: usize, settle: Duration) -> Result<()> {
    let node = format!("bdma_c2h_{channel}");
    let Handle::Engine(h) = registry.open(&node)? else {
        bail!("{node} is not an engine node");
    };

    let mut buffer = vec![0u8; ENGINE_TEST_BYTES];
    let (src, dest) = buffer.split_at_mut(ENGINE_TEST_BYTES / 2);
    src.fill(b'a');
    dest.fill(b'b');

    let base = buffer.as_ptr() as u64;
    let len = buffer.len() as u64;
    println!("Allocated memory @ {base:#x}, size {len}");

    h.write(TransferRequest::new(base, len, control::REGISTER_MEMORY).as_bytes())?;
    let mut status = [0u8; STATUS_LEN];
    h.read(&mut status)?;
    let status = StatusRecord::parse(&status)?;
    println!(
        "Registered {:#x}, {} bytes ({} pages)",
        status.addr,
        status.length,
        status.length / PAGE_SIZE
    );

    let dest_addr = base + len / 2;
    println!("DMA read  @ {base:#x}, data {:?}", char::from(buffer[0]));
    h.write(TransferRequest::new(base, 8, control::READ).as_bytes())?;

    println!(
        "DMA write @ {dest_addr:#x}, original data {:?}",
        char::from(buffer[ENGINE_TEST_BYTES / 2])
    );
    h.write(TransferRequest::new(dest_addr, 8, control::WRITE).as_bytes())?;

    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    println!(
        "After DMA @ {dest_addr:#x}, data {:?}",
        char::from(buffer[ENGINE_TEST_BYTES / 2])
    );
    Ok(())
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    bdma_driver::vfio::bind_to_vfio(pcie_addr)?;
    println!("{pcie_addr} bound to vfio-pci");
    println!(
        "Grant access: sudo chown $USER /dev/vfio/{}",
        bdma_driver::vfio::iommu_group(pcie_addr)?
    );
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    bdma_driver::vfio::unbind_from_vfio(pcie_addr)?;
    println!("{pcie_addr} unbound from vfio-pci");
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = bdma_driver::vfio::iommu_group(pcie_addr)?;
    println!("{group}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_u32("0x10").unwrap(), 16);
        assert_eq!(parse_u32("0XfF").unwrap(), 255);
        assert_eq!(parse_u32("42").unwrap(), 42);
        assert!(parse_u32("0xZZ").is_err());
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn emulated_reg_test_round_trips() {
        let registry = attach(true, 0).unwrap();
        cmd_reg_test(&registry, 0xDEAD_BEEF, 0x20).unwrap();
    }

    #[test]
    fn emulated_engine_test_runs() {
        let registry = attach(true, 0).unwrap();
        cmd_engine_test(&registry, 1, Duration::ZERO).unwrap();
    }

    #[test]
    fn cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
        let cli = Cli::parse_from(["bdma", "--emulated", "reg-test", "0xdeadbeef", "4"]);
        assert!(cli.emulated);
        assert!(matches!(
            cli.command,
            Cmd::RegTest {
                data: 0xDEAD_BEEF,
                offset: 4
            }
        ));
    }
}
