//! CTS256A-AL2 board glue: memory map, input pacing, and the debug/EOF
//! watchdogs that drive a mask-ROM TMS7000 program from a stream of ASCII
//! text down to SP0256 allophone codes.

use std::cell::Cell;
use std::collections::VecDeque;

use crate::core::{Bus, BusMaster, bus::InterruptState};
use crate::cpu::Tms7000;

const DEBUG_CTR_RELOAD: u32 = 999_999;
const EOF_CTR_RELOAD: u32 = 199_999;

const RAM_SIZE: usize = 0x800;
const ROM_SIZE: usize = 0x1000;

/// 64-entry allophone label table used by `'T'`-mode text output, reproduced
/// verbatim from the board's own table.
pub const SP0256_LABELS: [&str; 64] = [
    "PA1", "PA2", "PA3", "PA4", "PA5", "OY", "AY", "EH", "KK3", "PP", "JH", "NN1", "IH", "TT2",
    "RR1", "AX", "MM", "TT1", "DH1", "IY", "EY", "DD1", "UW1", "AO", "AA", "YY2", "AE", "HH1",
    "BB1", "TH", "UH", "UW2", "AW", "DD2", "GG3", "VV", "GG1", "SH", "ZH", "RR2", "FF", "KK2",
    "KK1", "ZZ", "NG", "LL", "WW", "XR", "WH", "YY1", "CH", "ER1", "ER2", "OW", "DH2", "SS",
    "NN2", "HH2", "OR", "AR", "YR", "GG2", "EL", "BB2",
];

/// ASCII-keyed option flags the original board takes on its command line.
#[derive(Debug, Clone)]
pub struct CtsOptions {
    /// `'E'`: copy accepted input bytes into the trace buffer.
    pub echo: bool,
    /// `'D'`: on watchdog underflow, stall (`Stopped`) instead of exiting.
    pub debug: bool,
    /// `'V'`: trace every input byte and every SP0256 code emitted.
    pub verbose: bool,
    /// `'N'`: suppress the mask ROM's "OK" prolog while `initctr > 0`.
    pub suppress_ok: bool,
    /// `'M'`: `'T'` emits allophone label text, `'B'` emits raw 6-bit codes.
    pub mode: char,
}

impl Default for CtsOptions {
    fn default() -> Self {
        Self { echo: false, debug: false, verbose: false, suppress_ok: false, mode: 'T' }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    /// Carries a diagnostic reason rather than a bare unit, so a caller
    /// doesn't need to re-derive why the board stalled.
    Stopped(&'static str),
    Exited,
}

/// The board's side of the TMS7000 bus: ROM/RAM/port decode, input pacing,
/// and the watchdog counters. Kept separate from [`CtsBoard`] so the two can
/// be borrowed independently when driving `Tms7000::step`.
struct CtsMemory<'a> {
    rom: &'a [u8],
    ram: [u8; RAM_SIZE],
    options: CtsOptions,
    input: VecDeque<u8>,
    eof: bool,
    initctr: u32,
    debugctr: u32,
    eofctr: u32,
    bport: u8,
    sp0256_codes: VecDeque<u8>,
    trace: VecDeque<String>,
    stall: Cell<Option<StallKind>>,
    pending_irq1: Cell<bool>,
    pending_irq3: Cell<bool>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StallKind {
    Stop,
    Exit,
}

impl<'a> CtsMemory<'a> {
    fn new(rom: &'a [u8], options: CtsOptions) -> Self {
        assert!(rom.len() >= ROM_SIZE, "CTS256A-AL2 mask ROM must be at least 4 KiB");
        Self {
            rom,
            ram: [0; RAM_SIZE],
            options,
            input: VecDeque::new(),
            eof: false,
            initctr: 6,
            debugctr: DEBUG_CTR_RELOAD,
            eofctr: EOF_CTR_RELOAD,
            bport: 0,
            sp0256_codes: VecDeque::new(),
            trace: VecDeque::new(),
            stall: Cell::new(None),
            pending_irq1: Cell::new(false),
            pending_irq3: Cell::new(false),
        }
    }

    fn trace_line(&mut self, line: String) {
        if self.options.verbose {
            self.trace.push_back(line);
        }
    }
}

impl<'a> Bus for CtsMemory<'a> {
    type Address = u16;
    type Data = u8;

    fn read(&mut self, _master: BusMaster, addr: u16) -> u8 {
        self.pending_irq1.set(true);

        if !self.eof {
            if self.initctr == 0 && self.bport & 0x01 != 0 {
                self.pending_irq3.set(true);
            }
            self.debugctr -= 1;
            if self.debugctr == 0 {
                self.debugctr = DEBUG_CTR_RELOAD;
                self.stall.set(Some(StallKind::Stop));
            }
        } else {
            self.eofctr -= 1;
            if self.eofctr == 0 {
                self.stall.set(Some(if self.options.debug { StallKind::Stop } else { StallKind::Exit }));
            }
        }

        if addr >= 0xF000 {
            return self.rom[(addr & 0x0FFF) as usize];
        }
        if addr < 0x1000 {
            let Some(c) = self.input.pop_front() else {
                self.eof = true;
                self.eofctr = EOF_CTR_RELOAD;
                self.trace_line(" in: EOF".to_string());
                return 0x0D;
            };
            if self.options.verbose {
                self.trace_line(format!(" in: {}", c as char));
            }
            if self.options.echo {
                self.trace_line(format!("echo: {}", c as char));
            }
            self.debugctr = DEBUG_CTR_RELOAD;
            return c;
        }
        if addr < 0x2000 {
            return 0;
        }
        if addr < 0x3000 {
            return 0xFF;
        }
        if addr < 0x3800 {
            return self.ram[(addr & 0x07FF) as usize];
        }
        0xFF
    }

    fn write(&mut self, _master: BusMaster, addr: u16, data: u8) {
        if addr >= 0xF000 || (0x0000..0x2000).contains(&addr) {
            return;
        }
        if addr < 0x3000 {
            if self.eof {
                self.eofctr = EOF_CTR_RELOAD;
            }
            let code = data & 0x3F;
            if self.options.verbose {
                let label = SP0256_LABELS.get(code as usize).copied().unwrap_or("**");
                self.trace_line(format!(" SP0256: {code:02X}={label}"));
            }
            if !self.options.suppress_ok || self.initctr == 0 {
                self.sp0256_codes.push_back(code);
                if self.options.mode == 'T' {
                    let label = SP0256_LABELS.get(code as usize).copied().unwrap_or("**");
                    self.trace_line(format!(" {label}"));
                }
            }
            if self.initctr > 0 {
                self.initctr -= 1;
            }
            self.debugctr = DEBUG_CTR_RELOAD;
            return;
        }
        if addr < 0x3800 {
            self.ram[(addr & 0x07FF) as usize] = data;
        }
    }

    fn io_read(&mut self, _master: BusMaster, addr: u16) -> u8 {
        match addr {
            0x04 => 0x90,
            0x06 => 0xFF,
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, _master: BusMaster, addr: u16, data: u8) {
        if addr == 0x06 {
            self.bport = data;
        }
    }

    fn is_halted_for(&self, _master: BusMaster) -> bool {
        false
    }

    fn check_interrupts(&self, _target: BusMaster) -> InterruptState {
        InterruptState { irq1: self.pending_irq1.replace(false), irq3: self.pending_irq3.replace(false) }
    }
}

/// A TMS7000 running the CTS256A-AL2 mask ROM, feeding an SP0256-command
/// stream from a queue of input bytes.
pub struct CtsBoard<'a> {
    cpu: Tms7000,
    mem: CtsMemory<'a>,
}

impl<'a> CtsBoard<'a> {
    /// `rom` is the 4 KiB CTS256A-AL2 mask ROM image.
    pub fn new(rom: &'a [u8], options: CtsOptions) -> Self {
        let mut mem = CtsMemory::new(rom, options);
        let mut cpu = Tms7000::new();
        cpu.reset();
        cpu.load_reset_vector(&mut mem, BusMaster::Cpu(0));
        Self { cpu, mem }
    }

    /// Queue one ASCII byte for the micro to read through the parallel
    /// input port.
    pub fn feed(&mut self, byte: u8) {
        self.mem.input.push_back(byte);
    }

    /// Queue a run of ASCII bytes.
    pub fn feed_str(&mut self, text: &str) {
        self.mem.input.extend(text.bytes());
    }

    /// Mark the input stream exhausted; subsequent reads past the queued
    /// bytes deliver `0x0D` and drain under the `eofctr` watchdog.
    pub fn end_of_input(&mut self) {
        // `eof` is latched lazily on the first read past the queue; nothing
        // to do here beyond leaving the queue empty, matching the original
        // board's stream-based EOF detection.
    }

    /// Advance the micro by exactly one instruction.
    pub fn step(&mut self) -> StepResult {
        let executed = self.cpu.step(&mut self.mem, BusMaster::Cpu(0));
        if !executed {
            return StepResult::Stopped("illegal opcode");
        }
        match self.mem.stall.replace(None) {
            Some(StallKind::Stop) => StepResult::Stopped("debug watchdog stall"),
            Some(StallKind::Exit) => StepResult::Exited,
            None => StepResult::Continue,
        }
    }

    /// Drain the next emitted SP0256 allophone code (6 bits), if any.
    pub fn take_sp0256_code(&mut self) -> Option<u8> {
        self.mem.sp0256_codes.pop_front()
    }

    /// Drain the next verbose/echo trace line, if tracing is enabled.
    pub fn take_trace_line(&mut self) -> Option<String> {
        self.mem.trace.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with_program(program: &[(u16, u8)]) -> Vec<u8> {
        let mut rom = vec![0u8; ROM_SIZE];
        for &(addr, byte) in program {
            rom[(addr & 0x0FFF) as usize] = byte;
        }
        // Reset vector -> 0xF000.
        rom[0x0FFE] = 0xF0;
        rom[0x0FFF] = 0x00;
        rom
    }

    #[test]
    fn board_resets_pc_to_reset_vector() {
        let rom = rom_with_program(&[(0xF000, 0x00)]); // NOP
        let board = CtsBoard::new(&rom, CtsOptions::default());
        assert_eq!(board.cpu.pc, 0xF000);
    }

    #[test]
    fn feeding_input_is_readable_through_parallel_port() {
        let mut rom_vec = rom_with_program(&[]);
        // LDA @0x0200 ; reads the parallel input port into A.
        rom_vec[0x0000] = 0x8A;
        rom_vec[0x0001] = 0x02;
        rom_vec[0x0002] = 0x00;
        let mut board = CtsBoard::new(&rom_vec, CtsOptions::default());
        board.feed(b'H');
        board.step();
        assert_eq!(board.cpu.data[0], b'H');
    }

    #[test]
    fn sp0256_write_port_emits_a_masked_code() {
        let mut rom_vec = rom_with_program(&[]);
        // MOV %>27, A ; STA @0x2000
        rom_vec[0x0000] = 0x22;
        rom_vec[0x0001] = 0x27;
        rom_vec[0x0002] = 0x8B;
        rom_vec[0x0003] = 0x20;
        rom_vec[0x0004] = 0x00;
        let mut options = CtsOptions::default();
        options.suppress_ok = false;
        let mut board = CtsBoard::new(&rom_vec, options);
        board.step();
        board.step();
        assert_eq!(board.take_sp0256_code(), Some(0x27));
    }

    #[test]
    fn exhausted_input_sets_eof_and_delivers_carriage_return() {
        let mut rom_vec = rom_with_program(&[]);
        rom_vec[0x0000] = 0x8A; // LDA @0x0200
        rom_vec[0x0001] = 0x02;
        rom_vec[0x0002] = 0x00;
        let mut board = CtsBoard::new(&rom_vec, CtsOptions::default());
        board.step();
        assert_eq!(board.cpu.data[0], 0x0D);
    }

    #[test]
    fn debugctr_underflow_requests_a_stall() {
        let mut rom_vec = rom_with_program(&[]);
        rom_vec[0x0000] = 0x8A; // LDA @0x0200
        rom_vec[0x0001] = 0x02;
        rom_vec[0x0002] = 0x00;
        let mut board = CtsBoard::new(&rom_vec, CtsOptions::default());
        board.mem.debugctr = 1;
        let result = board.step();
        assert_eq!(result, StepResult::Stopped("debug watchdog stall"));
        assert_eq!(board.mem.debugctr, DEBUG_CTR_RELOAD);
    }
}
