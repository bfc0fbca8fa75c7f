//! Boot-stage binary: bring up the storage controllers and load the next
//! stage.
//!
//! Everything above the driver seam lives here: the platform constants,
//! the clock/phy stubs the drivers call through, and the boot-medium
//! fallback ladder. The ladder tries the SD slot first and the soldered
//! eMMC second, reading the graded outcome codes by threshold: a
//! `Transient` read is retried on the same medium, anything worse moves
//! on to the next one.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use emberboot::blockdev::BlockDev;
use emberboot::drivers::{dwmmc, sdhci};
use emberboot::iost::IoStatus;
use emberboot::println;
use emberboot::sched::Scheduler;
use emberboot::timer::CounterTimebase;
use emberboot::types::{PhysAddr, PhysRange};
use emberboot::wait::Spin;

// ==== platform configuration ====

/// SD slot controller (DesignWare MSHC) register base.
const SDMMC_BASE: usize = 0xfe32_0000;
/// eMMC controller (SDHC) register base.
const EMMC_BASE: usize = 0xfe33_0000;

/// First block of the next-stage image on either medium.
const PAYLOAD_LBA: u64 = 64;
/// Identity-mapped DRAM the image is loaded into.
const PAYLOAD_ADDR: u64 = 0x0400_0000;
const PAYLOAD_BYTES: u64 = 1024 * 1024;

/// Transient read faults retried per medium before falling through.
const READ_ATTEMPTS: u32 = 3;

/// Controller clock plumbing. The loader that ran before this stage left
/// the clock tree configured for every rate the drivers ask for, so both
/// seams are acknowledgement-only here.
struct PlatformClocks;

impl dwmmc::SignalServices for PlatformClocks {
    fn set_clock(&self, _rate: dwmmc::ClockRate) -> bool {
        true
    }
}

impl sdhci::SdhciPhy for PlatformClocks {
    fn setup(&self, _action: sdhci::PhyAction) -> bool {
        true
    }

    fn lock_freq(&self, _khz: u32) -> bool {
        true
    }
}

static CLOCKS: PlatformClocks = PlatformClocks;

fn payload_buf() -> PhysRange {
    PhysRange::new(
        PhysAddr(PAYLOAD_ADDR),
        PhysAddr(PAYLOAD_ADDR + PAYLOAD_BYTES),
    )
}

/// Issue the payload read, retrying while the outcome stays retryable.
fn read_with_retries<D, W>(dev: &D, wait: W) -> IoStatus
where
    D: BlockDev,
    W: Fn() -> IoStatus,
{
    let mut last = IoStatus::Transient;
    for attempt in 0..READ_ATTEMPTS {
        if attempt != 0 {
            println!("boot: read attempt {}", attempt + 1);
        }
        let st = dev.start(PAYLOAD_LBA, payload_buf());
        last = if st == IoStatus::Ok { wait() } else { st };
        if !last.retryable() {
            return last;
        }
    }
    last
}

fn boot_from_sd(sched: &Scheduler, tb: &CounterTimebase) -> IoStatus {
    // SAFETY: the controller's MMIO window, identity-mapped, borrowed
    // exactly once for the lifetime of this attempt.
    let regs = unsafe { emberboot::mmio::device::<dwmmc::regs::DwmmcRegs>(SDMMC_BASE) };
    let transfer = dwmmc::Transfer::new();
    let ctrl = dwmmc::Dwmmc::new(regs, tb);
    let st = ctrl.init(&Spin, &CLOCKS);
    if st != IoStatus::Ok {
        return st;
    }
    let dev = dwmmc::DwmmcBlockDev {
        ctrl: &ctrl,
        transfer: &transfer,
    };
    read_with_retries(&dev, || ctrl.wait_poll(sched, &transfer))
}

fn boot_from_emmc(sched: &Scheduler, tb: &CounterTimebase) -> IoStatus {
    // SAFETY: as above, for the eMMC controller's window.
    let regs = unsafe { emberboot::mmio::device::<sdhci::regs::SdhciRegs>(EMMC_BASE) };
    let transfer = sdhci::Transfer::new();
    let ctrl = sdhci::Sdhci::new(regs, tb, &CLOCKS);
    let st = ctrl.init(&Spin);
    if st != IoStatus::Ok {
        return st;
    }
    let dev = sdhci::SdhciBlockDev {
        ctrl: &ctrl,
        transfer: &transfer,
    };
    read_with_retries(&dev, || ctrl.wait_poll(sched, &transfer))
}

/// Jump to the loaded image. Never returns.
fn enter_payload() -> ! {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let entry: extern "C" fn() -> ! = core::mem::transmute(PAYLOAD_ADDR as usize);
        entry()
    }
    #[cfg(not(target_arch = "aarch64"))]
    emberboot::panic::halt()
}

fn boot_main() -> ! {
    println!();
    println!("{} {}", emberboot::NAME, emberboot::VERSION);

    let tb = CounterTimebase;
    let sched = Scheduler::new();

    let st = boot_from_sd(&sched, &tb);
    if st == IoStatus::Ok {
        println!("boot: payload loaded from SD");
        enter_payload();
    }
    println!("boot: SD unusable ({}), trying eMMC", st.name());

    let st = boot_from_emmc(&sched, &tb);
    if st == IoStatus::Ok {
        println!("boot: payload loaded from eMMC");
        enter_payload();
    }
    println!("boot: no usable boot medium ({})", st.name());
    emberboot::panic::halt()
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    boot_main()
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The image only runs on the target; hosted builds exist for the
    // library's test suite.
}
