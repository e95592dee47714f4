//! SP0256 narrow-band LPC speech synthesizer, plus the SPB-640 64-decle FIFO
//! that feeds it over a parallel host interface.

mod filter;
mod micro;

use filter::Lpc12;
use micro::Micro;

pub use micro::RomPages;

/// Result of a FIFO write: whether the decle was accepted or the FIFO was
/// already full (in which case the write is silently dropped, matching the
/// original hardware's behavior of the host polling `ready()`/FIFO status
/// before writing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoStatus {
    Accepted,
    Full,
}

/// A single SP0256 chip plus its attached SPB-640 FIFO. Mask ROM pages are
/// supplied by the caller at construction time; this type never embeds ROM
/// contents of its own.
pub struct Sp0256<'a> {
    filt: Lpc12,
    micro: Micro<'a>,
}

impl<'a> Sp0256<'a> {
    /// `rom` holds up to 16 logical 4096-byte pages addressed by the
    /// microsequencer's page register; an absent page reads as all zero.
    pub fn new(rom: RomPages<'a>) -> Self {
        Self {
            filt: Lpc12::new(),
            micro: Micro::new(rom),
        }
    }

    /// Power-on reset: halts the microsequencer, clears the FIFO and filter
    /// state, same as a FIFO-reset command (decle bit 10 set).
    pub fn reset(&mut self) {
        self.micro.reset_with_filter(&mut self.filt);
    }

    /// True when the command/address latch is free to accept a new ALD
    /// command (status register bit 15, LRQ).
    pub fn ready(&self) -> bool {
        self.micro.lrq != 0
    }

    /// True once the microsequencer has run out of speech and is waiting
    /// for a command (status register bit 14 equivalent).
    pub fn halted(&self) -> bool {
        self.micro.halted
    }

    /// Load an ALD (Address Load) command: a 6-bit allophone index or, in
    /// the CTS256A-AL2's usage, any 8-bit value whose top bits select a mask
    /// ROM entry point. Latches into the address register; the
    /// microsequencer installs it as soon as it's next idle. A no-op while
    /// the chip is still busy with a previous command (`!ready()`).
    pub fn send_command(&mut self, cmd: u8) {
        if self.micro.lrq == 0 {
            return;
        }
        self.micro.ald = (cmd as u32) << 4;
        self.micro.lrq = 0;
    }

    /// Write one 10-bit decle to the SPB-640 FIFO. Bit 10 set triggers a
    /// full chip reset instead of queuing data, matching the SPB-640's
    /// command/data decle convention.
    pub fn write_fifo(&mut self, decle: u16) -> FifoStatus {
        if decle & 0x400 != 0 {
            self.reset();
            return FifoStatus::Accepted;
        }
        if self.micro.fifo_push(decle) {
            FifoStatus::Accepted
        } else {
            FifoStatus::Full
        }
    }

    /// True when the FIFO cannot accept another decle.
    pub fn fifo_full(&self) -> bool {
        self.micro.fifo_full()
    }

    /// Advance the microsequencer until the filter bank has an excitation
    /// period in progress, then produce exactly one 16-bit PCM sample.
    pub fn next_sample(&mut self) -> i16 {
        if self.filt.rpt <= 0 && self.filt.cnt <= 0 {
            self.micro.run(&mut self.filt);
        }
        let quiescent = self.filt.rpt <= 0 && self.filt.cnt <= 0;
        if self.micro.halted || (self.micro.silent && quiescent) {
            0
        } else {
            let mut buf = [0i16; 1];
            self.filt.update(&mut buf);
            buf[0]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_leaves_chip_halted_and_ready() {
        let mut chip = Sp0256::new([None; 16]);
        chip.reset();
        assert!(chip.halted());
        assert!(chip.ready());
        assert_eq!(chip.next_sample(), 0);
    }

    #[test]
    fn fifo_accepts_up_to_64_decles_then_reports_full() {
        let mut chip = Sp0256::new([None; 16]);
        chip.reset();
        for _ in 0..64 {
            assert_eq!(chip.write_fifo(0x001), FifoStatus::Accepted);
        }
        assert!(chip.fifo_full());
        assert_eq!(chip.write_fifo(0x001), FifoStatus::Full);
    }

    #[test]
    fn fifo_reset_decle_clears_fifo_full_state() {
        let mut chip = Sp0256::new([None; 16]);
        chip.reset();
        for _ in 0..64 {
            chip.write_fifo(0x001);
        }
        assert!(chip.fifo_full());
        chip.write_fifo(0x400);
        assert!(!chip.fifo_full());
        assert!(chip.halted());
    }

    #[test]
    fn send_command_clears_ready_until_microsequencer_installs_it() {
        let mut chip = Sp0256::new([None; 16]);
        chip.reset();
        chip.send_command(0x00);
        assert!(!chip.ready());
    }
}
