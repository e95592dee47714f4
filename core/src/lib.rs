pub mod core;
pub mod cpu;
pub mod device;

pub mod prelude {
    pub use crate::core::{Bus, BusMaster, BusMasterComponent, Component, bus::InterruptState};
    pub use crate::cpu::Cpu;
    pub use crate::device::cts256::{CtsBoard, StepResult};
    pub use crate::device::sp0256::{FifoStatus, RomPages, Sp0256};
}
