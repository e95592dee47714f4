//! Bit-serial microsequencer: decodes 4-bit opcodes plus 4-bit immediates out
//! of mask ROM (or the SPB-640 FIFO) and patches the LPC filter bank's
//! registers between excitation periods.

use super::filter::{Lpc12, PER_PAUSE, REG_AMP, REG_IA, REG_IP, REG_PER};

const FIFO_ADDR: u32 = 0x1800 << 3;

/// Register indices matching the `enum { AM, PR, B0, F0, ... IA, IP }`
/// layout used by the control-word table below.
mod reg {
    pub const AM: u8 = 0;
    pub const PR: u8 = 1;
    pub const B0: u8 = 2;
    pub const F0: u8 = 3;
    pub const B1: u8 = 4;
    pub const F1: u8 = 5;
    pub const B2: u8 = 6;
    pub const F2: u8 = 7;
    pub const B3: u8 = 8;
    pub const F3: u8 = 9;
    pub const B4: u8 = 10;
    pub const F4: u8 = 11;
    pub const B5: u8 = 12;
    pub const F5: u8 = 13;
    pub const IA: u8 = 14;
    pub const IP: u8 = 15;
}

/// Packs `(len:4, shf:4, prm:4, delta:1, field:1, clr5:1, clrall:1)` into a
/// control word, matching the original `CR()` macro bit-for-bit.
const fn cr(len: u8, shf: u8, prm: u8, delta: u8, field: u8, clr5: u8, clrall: u8) -> u16 {
    ((len as u16 & 15) << 0)
        | ((shf as u16 & 15) << 4)
        | ((prm as u16 & 15) << 8)
        | ((delta as u16 & 1) << 12)
        | ((field as u16 & 1) << 13)
        | ((clr5 as u16 & 1) << 14)
        | ((clrall as u16 & 1) << 15)
}

const fn cr_len(w: u16) -> u8 {
    (w & 15) as u8
}
const fn cr_shf(w: u16) -> u8 {
    ((w >> 4) & 15) as u8
}
const fn cr_prm(w: u16) -> u8 {
    ((w >> 8) & 15) as u8
}
const CR_DELTA: u16 = 1 << 12;
const CR_FIELD: u16 = 1 << 13;
const CR_CLRL: u16 = 1 << 15;

use reg::*;

/// The 191-entry control-word table, one opcode/mode data-block per slice.
/// Reproduced verbatim; see `DF_IDX` below for the slice boundaries.
pub(super) const DATAFMT: [u16; 191] = [
    /* 0 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 1 */ cr(8, 0, AM, 0, 0, 0, 0),
    /* 2 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 3 */ cr(8, 0, B0, 0, 0, 0, 0),
    /* 4 */ cr(8, 0, F0, 0, 0, 0, 0),
    /* 5 */ cr(8, 0, B1, 0, 0, 0, 0),
    /* 6 */ cr(8, 0, F1, 0, 0, 0, 0),
    /* 7 */ cr(8, 0, B2, 0, 0, 0, 0),
    /* 8 */ cr(8, 0, F2, 0, 0, 0, 0),
    /* 9 */ cr(8, 0, B3, 0, 0, 0, 0),
    /* 10 */ cr(8, 0, F3, 0, 0, 0, 0),
    /* 11 */ cr(8, 0, B4, 0, 0, 0, 0),
    /* 12 */ cr(8, 0, F4, 0, 0, 0, 0),
    /* 13 */ cr(8, 0, B5, 0, 0, 0, 0),
    /* 14 */ cr(8, 0, F5, 0, 0, 0, 0),
    /* 15 */ cr(8, 0, IA, 0, 0, 0, 0),
    /* 16 */ cr(8, 0, IP, 0, 0, 0, 0),
    /* 17 */ cr(6, 2, AM, 0, 0, 0, 1),
    /* 18 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 19 */ cr(4, 3, B3, 0, 0, 0, 0),
    /* 20 */ cr(6, 2, F3, 0, 0, 0, 0),
    /* 21 */ cr(7, 1, B4, 0, 0, 0, 0),
    /* 22 */ cr(6, 2, F4, 0, 0, 0, 0),
    /* 23 */ cr(8, 0, B5, 0, 0, 0, 0),
    /* 24 */ cr(8, 0, F5, 0, 0, 0, 0),
    /* 25 */ cr(6, 2, AM, 0, 0, 0, 1),
    /* 26 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 27 */ cr(6, 1, B3, 0, 0, 0, 0),
    /* 28 */ cr(7, 1, F3, 0, 0, 0, 0),
    /* 29 */ cr(8, 0, B4, 0, 0, 0, 0),
    /* 30 */ cr(8, 0, F4, 0, 0, 0, 0),
    /* 31 */ cr(8, 0, B5, 0, 0, 0, 0),
    /* 32 */ cr(8, 0, F5, 0, 0, 0, 0),
    /* 33 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 34 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 35 */ cr(6, 2, F3, 0, 1, 0, 0),
    /* 36 */ cr(6, 2, F4, 0, 1, 0, 0),
    /* 37 */ cr(8, 0, F5, 0, 1, 0, 0),
    /* 38 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 39 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 40 */ cr(7, 1, F3, 0, 1, 0, 0),
    /* 41 */ cr(8, 0, F4, 0, 1, 0, 0),
    /* 42 */ cr(8, 0, F5, 0, 1, 0, 0),
    /* 43 */ 0,
    /* 44 */ 0,
    /* 45 */ cr(4, 2, AM, 1, 0, 0, 0),
    /* 46 */ cr(5, 0, PR, 1, 0, 0, 0),
    /* 47 */ cr(3, 4, B0, 1, 0, 0, 0),
    /* 48 */ cr(3, 3, F0, 1, 0, 0, 0),
    /* 49 */ cr(3, 4, B1, 1, 0, 0, 0),
    /* 50 */ cr(3, 3, F1, 1, 0, 0, 0),
    /* 51 */ cr(3, 4, B2, 1, 0, 0, 0),
    /* 52 */ cr(3, 3, F2, 1, 0, 0, 0),
    /* 53 */ cr(3, 3, B3, 1, 0, 0, 0),
    /* 54 */ cr(4, 2, F3, 1, 0, 0, 0),
    /* 55 */ cr(4, 1, B4, 1, 0, 0, 0),
    /* 56 */ cr(4, 2, F4, 1, 0, 0, 0),
    /* 57 */ cr(5, 0, B5, 1, 0, 0, 0),
    /* 58 */ cr(5, 0, F5, 1, 0, 0, 0),
    /* 59 */ cr(4, 2, AM, 1, 0, 0, 0),
    /* 60 */ cr(5, 0, PR, 1, 0, 0, 0),
    /* 61 */ cr(4, 1, B0, 1, 0, 0, 0),
    /* 62 */ cr(4, 2, F0, 1, 0, 0, 0),
    /* 63 */ cr(4, 1, B1, 1, 0, 0, 0),
    /* 64 */ cr(4, 2, F1, 1, 0, 0, 0),
    /* 65 */ cr(4, 1, B2, 1, 0, 0, 0),
    /* 66 */ cr(4, 2, F2, 1, 0, 0, 0),
    /* 67 */ cr(4, 1, B3, 1, 0, 0, 0),
    /* 68 */ cr(5, 1, F3, 1, 0, 0, 0),
    /* 69 */ cr(5, 0, B4, 1, 0, 0, 0),
    /* 70 */ cr(5, 0, F4, 1, 0, 0, 0),
    /* 71 */ cr(5, 0, B5, 1, 0, 0, 0),
    /* 72 */ cr(5, 0, F5, 1, 0, 0, 0),
    /* 73 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 74 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 75 */ cr(5, 3, F0, 0, 1, 0, 0),
    /* 76 */ cr(5, 3, F1, 0, 1, 0, 0),
    /* 77 */ cr(5, 3, F2, 0, 1, 0, 0),
    /* 78 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 79 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 80 */ cr(6, 2, F0, 0, 1, 0, 0),
    /* 81 */ cr(6, 2, F1, 0, 1, 0, 0),
    /* 82 */ cr(6, 2, F2, 0, 1, 0, 0),
    /* 83 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 84 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 85 */ cr(3, 4, B0, 0, 0, 0, 0),
    /* 86 */ cr(5, 3, F0, 0, 0, 0, 0),
    /* 87 */ cr(3, 4, B1, 0, 0, 0, 0),
    /* 88 */ cr(5, 3, F1, 0, 0, 0, 0),
    /* 89 */ cr(3, 4, B2, 0, 0, 0, 0),
    /* 90 */ cr(5, 3, F2, 0, 0, 0, 0),
    /* 91 */ cr(4, 3, B3, 0, 0, 0, 0),
    /* 92 */ cr(6, 2, F3, 0, 0, 0, 0),
    /* 93 */ cr(7, 1, B4, 0, 0, 0, 0),
    /* 94 */ cr(6, 2, F4, 0, 0, 0, 0),
    /* 95 */ cr(5, 0, IA, 0, 0, 0, 0),
    /* 96 */ cr(5, 0, IP, 0, 0, 0, 0),
    /* 97 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 98 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 99 */ cr(6, 1, B0, 0, 0, 0, 0),
    /* 100 */ cr(6, 2, F0, 0, 0, 0, 0),
    /* 101 */ cr(6, 1, B1, 0, 0, 0, 0),
    /* 102 */ cr(6, 2, F1, 0, 0, 0, 0),
    /* 103 */ cr(6, 1, B2, 0, 0, 0, 0),
    /* 104 */ cr(6, 2, F2, 0, 0, 0, 0),
    /* 105 */ cr(6, 1, B3, 0, 0, 0, 0),
    /* 106 */ cr(7, 1, F3, 0, 0, 0, 0),
    /* 107 */ cr(8, 0, B4, 0, 0, 0, 0),
    /* 108 */ cr(8, 0, F4, 0, 0, 0, 0),
    /* 109 */ cr(5, 0, IA, 0, 0, 0, 0),
    /* 110 */ cr(5, 0, IP, 0, 0, 0, 0),
    /* 111 */ cr(4, 2, AM, 1, 0, 0, 1),
    /* 112 */ cr(5, 0, PR, 1, 0, 0, 0),
    /* 113 */ cr(3, 3, B3, 1, 0, 0, 0),
    /* 114 */ cr(4, 2, F3, 1, 0, 0, 0),
    /* 115 */ cr(4, 1, B4, 1, 0, 0, 0),
    /* 116 */ cr(4, 2, F4, 1, 0, 0, 0),
    /* 117 */ cr(5, 0, B5, 1, 0, 0, 0),
    /* 118 */ cr(5, 0, F5, 1, 0, 0, 0),
    /* 119 */ cr(4, 2, AM, 1, 0, 0, 0),
    /* 120 */ cr(5, 0, PR, 1, 0, 0, 0),
    /* 121 */ cr(4, 1, B3, 1, 0, 0, 0),
    /* 122 */ cr(5, 1, F3, 1, 0, 0, 0),
    /* 123 */ cr(5, 0, B4, 1, 0, 0, 0),
    /* 124 */ cr(5, 0, F4, 1, 0, 0, 0),
    /* 125 */ cr(5, 0, B5, 1, 0, 0, 0),
    /* 126 */ cr(5, 0, F5, 1, 0, 0, 0),
    /* 127 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 128 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 129 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 130 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 131 */ cr(3, 4, B0, 0, 0, 0, 0),
    /* 132 */ cr(5, 3, F0, 0, 0, 0, 0),
    /* 133 */ cr(3, 4, B1, 0, 0, 0, 0),
    /* 134 */ cr(5, 3, F1, 0, 0, 0, 0),
    /* 135 */ cr(3, 4, B2, 0, 0, 0, 0),
    /* 136 */ cr(5, 3, F2, 0, 0, 0, 0),
    /* 137 */ cr(4, 3, B3, 0, 0, 0, 0),
    /* 138 */ cr(6, 2, F3, 0, 0, 0, 0),
    /* 139 */ cr(7, 1, B4, 0, 0, 0, 0),
    /* 140 */ cr(6, 2, F4, 0, 0, 0, 0),
    /* 141 */ cr(8, 0, B5, 0, 0, 0, 0),
    /* 142 */ cr(8, 0, F5, 0, 0, 0, 0),
    /* 143 */ cr(5, 0, IA, 0, 0, 0, 0),
    /* 144 */ cr(5, 0, IP, 0, 0, 0, 0),
    /* 145 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 146 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 147 */ cr(6, 1, B0, 0, 0, 0, 0),
    /* 148 */ cr(6, 2, F0, 0, 0, 0, 0),
    /* 149 */ cr(6, 1, B1, 0, 0, 0, 0),
    /* 150 */ cr(6, 2, F1, 0, 0, 0, 0),
    /* 151 */ cr(6, 1, B2, 0, 0, 0, 0),
    /* 152 */ cr(6, 2, F2, 0, 0, 0, 0),
    /* 153 */ cr(6, 1, B3, 0, 0, 0, 0),
    /* 154 */ cr(7, 1, F3, 0, 0, 0, 0),
    /* 155 */ cr(8, 0, B4, 0, 0, 0, 0),
    /* 156 */ cr(8, 0, F4, 0, 0, 0, 0),
    /* 157 */ cr(8, 0, B5, 0, 0, 0, 0),
    /* 158 */ cr(8, 0, F5, 0, 0, 0, 0),
    /* 159 */ cr(5, 0, IA, 0, 0, 0, 0),
    /* 160 */ cr(5, 0, IP, 0, 0, 0, 0),
    /* 161 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 162 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 163 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 164 */ cr(5, 3, F0, 0, 1, 0, 0),
    /* 165 */ cr(5, 3, F1, 0, 1, 0, 0),
    /* 166 */ cr(5, 3, F2, 0, 1, 0, 0),
    /* 167 */ cr(5, 0, IA, 0, 0, 0, 0),
    /* 168 */ cr(5, 0, IP, 0, 0, 0, 0),
    /* 169 */ cr(0, 0, 0, 0, 0, 0, 0),
    /* 170 */ cr(6, 2, AM, 0, 0, 0, 0),
    /* 171 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 172 */ cr(6, 2, F0, 0, 1, 0, 0),
    /* 173 */ cr(6, 2, F1, 0, 1, 0, 0),
    /* 174 */ cr(6, 2, F2, 0, 1, 0, 0),
    /* 175 */ cr(5, 0, IA, 0, 0, 0, 0),
    /* 176 */ cr(5, 0, IP, 0, 0, 0, 0),
    /* 177 */ cr(8, 0, AM, 0, 0, 0, 0),
    /* 178 */ cr(8, 0, PR, 0, 0, 0, 0),
    /* 179 */ cr(8, 0, B0, 0, 0, 0, 0),
    /* 180 */ cr(8, 0, F0, 0, 0, 0, 0),
    /* 181 */ cr(8, 0, B1, 0, 0, 0, 0),
    /* 182 */ cr(8, 0, F1, 0, 0, 0, 0),
    /* 183 */ cr(8, 0, B2, 0, 0, 0, 0),
    /* 184 */ cr(8, 0, F2, 0, 0, 0, 0),
    /* 185 */ cr(8, 0, B3, 0, 0, 0, 0),
    /* 186 */ cr(8, 0, F3, 0, 0, 0, 0),
    /* 187 */ cr(8, 0, B4, 0, 0, 0, 0),
    /* 188 */ cr(8, 0, F4, 0, 0, 0, 0),
    /* 189 */ cr(8, 0, IA, 0, 0, 0, 0),
    /* 190 */ cr(8, 0, IP, 0, 0, 0, 0),
];

/// Slice boundaries into `DATAFMT`, indexed by `(opcode << 3) | (mode & 6)`.
/// `-1` marks opcodes that never reach the data-block stage (0x0, 0x7, 0x8,
/// 0xB); the microsequencer's dispatch structurally never indexes those
/// rows.
pub(super) const DF_IDX: [i16; 128] = [
    -1, -1, -1, -1, -1, -1, -1, -1, // opcode 0000
    -1, -1, -1, -1, -1, -1, -1, -1, // opcode 1000
    17, 22, 17, 24, 25, 30, 25, 32, // opcode 0100
    83, 94, 129, 142, 97, 108, 145, 158, // opcode 1100
    83, 96, 129, 144, 97, 110, 145, 160, // opcode 0010
    73, 77, 74, 77, 78, 82, 79, 82, // opcode 1010
    33, 36, 34, 37, 38, 41, 39, 42, // opcode 0110
    127, 128, 127, 128, 127, 128, 127, 128, // opcode 1110
    177, 190, 1, 16, 177, 190, 1, 16, // opcode 0001
    45, 56, 45, 58, 59, 70, 59, 72, // opcode 1001
    161, 166, 162, 166, 169, 174, 170, 174, // opcode 0101
    111, 116, 111, 118, 119, 124, 119, 126, // opcode 1101
    161, 168, 162, 168, 169, 176, 170, 176, // opcode 0011
    -1, -1, -1, -1, -1, -1, -1, -1, // opcode 1011
    -1, -1, -1, -1, -1, -1, -1, -1, // opcode 0111
    0, 0, 0, 0, 0, 0, 0, 0, // opcode 1111
];

/// Fully reverse the bits of a 32-bit word (butterfly by 16/8/4/2/1).
/// Used to turn bit-packed branch-target immediates right-side-up.
pub(super) fn bitrev(mut val: u32) -> u32 {
    val = ((val & 0xFFFF0000) >> 16) | ((val & 0x0000FFFF) << 16);
    val = ((val & 0xFF00FF00) >> 8) | ((val & 0x00FF00FF) << 8);
    val = ((val & 0xF0F0F0F0) >> 4) | ((val & 0x0F0F0F0F) << 4);
    val = ((val & 0xCCCCCCCC) >> 2) | ((val & 0x33333333) << 2);
    val = ((val & 0xAAAAAAAA) >> 1) | ((val & 0x55555555) << 1);
    val
}

/// 64-decle SPB-640 FIFO: a ring of 10-bit words addressed by free-running
/// head/tail counters, plus a sub-decle bit pointer into the word at `tail`.
#[derive(Clone, Default)]
pub(super) struct Fifo {
    pub(super) data: [u16; 64],
    pub(super) head: u32,
    pub(super) tail: u32,
    pub(super) bitp: u32,
}

impl Fifo {
    fn full(&self) -> bool {
        self.head.wrapping_sub(self.tail) >= 64
    }

    fn push(&mut self, decle: u16) -> bool {
        if self.full() {
            return false;
        }
        self.data[(self.head & 63) as usize] = decle & 0x3FF;
        self.head = self.head.wrapping_add(1);
        true
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Up to 16 logical 4096-byte ROM pages; unpopulated pages read as zero.
pub type RomPages<'a> = [Option<&'a [u8]>; 16];

pub(super) struct Micro<'a> {
    pub(super) pc: u32,
    pub(super) stack: u32,
    pub(super) page: u32,
    pub(super) mode: u32,
    pub(super) ald: u32,
    pub(super) lrq: u32,
    pub(super) fifo_sel: bool,
    pub(super) halted: bool,
    pub(super) silent: bool,
    pub(super) fifo: Fifo,
    pub(super) rom: RomPages<'a>,
}

impl<'a> Micro<'a> {
    pub(super) fn new(rom: RomPages<'a>) -> Self {
        Self {
            pc: 0,
            stack: 0,
            page: 0x1000 << 3,
            mode: 0,
            ald: 0,
            lrq: 0x8000,
            fifo_sel: false,
            halted: true,
            silent: true,
            fifo: Fifo::default(),
            rom,
        }
    }

    pub(super) fn reset(&mut self) {
        let rom = self.rom;
        *self = Self::new(rom);
    }

    /// Full FIFO-reset semantics (bit 10 of a FIFO write), which also zeros
    /// the filter bank.
    pub(super) fn reset_with_filter(&mut self, filt: &mut Lpc12) {
        self.fifo.reset();
        filt.reset();
        self.halted = true;
        filt.rpt = -1;
        filt.rng = 1;
        self.lrq = 0x8000;
        self.ald = 0;
        self.pc = 0;
        self.stack = 0;
        self.fifo_sel = false;
        self.mode = 0;
        self.page = 0x1000 << 3;
        self.silent = true;
    }

    pub(super) fn fifo_full(&self) -> bool {
        self.fifo.full()
    }

    pub(super) fn fifo_push(&mut self, decle: u16) -> bool {
        self.fifo.push(decle)
    }

    fn getb(&mut self, len: u32) -> u32 {
        let data = if self.fifo_sel {
            let d0 = self.fifo.data[(self.fifo.tail & 63) as usize] as u32;
            let d1 = self.fifo.data[(self.fifo.tail.wrapping_add(1) & 63) as usize] as u32;
            let data = ((d1 << 10) | d0) >> self.fifo.bitp;
            self.fifo.bitp += len;
            if self.fifo.bitp >= 10 {
                self.fifo.tail = self.fifo.tail.wrapping_add(1);
                self.fifo.bitp -= 10;
            }
            data
        } else {
            let idx0 = (self.pc >> 3) as usize;
            let page0 = idx0 >> 12;
            let idx1 = ((self.pc + 8) >> 3) as usize;
            let page1 = idx1 >> 12;
            let idx0 = idx0 & 0xFFF;
            let idx1 = idx1 & 0xFFF;

            let d0 = self.rom[page0 & 15].and_then(|p| p.get(idx0)).copied().unwrap_or(0) as u32;
            let d1 = self.rom[page1 & 15].and_then(|p| p.get(idx1)).copied().unwrap_or(0) as u32;
            let data = ((d1 << 8) | d0) >> (self.pc & 7);
            self.pc += len;
            data
        };
        data & ((1u32 << len) - 1)
    }

    /// Run the microsequencer until the filter has work, or it halts waiting
    /// for a command.
    pub(super) fn run(&mut self, filt: &mut Lpc12) {
        while filt.rpt <= 0 && filt.cnt <= 0 {
            if self.halted && self.lrq == 0 {
                self.pc = self.ald | (0x1000 << 3);
                self.fifo_sel = false;
                self.halted = false;
                self.lrq = 0x8000;
                self.ald = 0;
            }

            if self.halted {
                filt.rpt = 1;
                filt.cnt = 0;
                self.lrq = 0x8000;
                self.ald = 0;
                return;
            }

            let immed4 = self.getb(4);
            let opcode = self.getb(4);
            let mut repeat: u32 = 0;
            let mut ctrl_xfer = false;

            match opcode {
                0x0 => {
                    if immed4 != 0 {
                        self.page = bitrev(immed4) >> 13;
                    } else {
                        let btrg = self.stack;
                        self.stack = 0;
                        if btrg == 0 {
                            self.halted = true;
                            self.pc = 0;
                        } else {
                            self.pc = btrg;
                        }
                        ctrl_xfer = true;
                    }
                }
                0xD | 0xE => {
                    let byte = self.getb(8);
                    let btrg = self.page | (bitrev(immed4) >> 17) | (bitrev(byte) >> 21);
                    ctrl_xfer = true;
                    if opcode == 0xD {
                        self.stack = (self.pc + 7) & !7;
                    }
                    self.pc = btrg;
                }
                0x1 => {
                    self.mode =
                        ((immed4 & 8) >> 2) | (immed4 & 4) | ((immed4 & 3) << 4);
                }
                _ => {
                    repeat = immed4 | (self.mode & 0x30);
                }
            }

            if opcode != 1 {
                self.mode &= 0xF;
            }

            if ctrl_xfer {
                self.fifo_sel = self.pc == FIFO_ADDR;
                if self.fifo_sel && self.fifo.bitp != 0 {
                    if self.fifo.tail < self.fifo.head {
                        self.fifo.tail = self.fifo.tail.wrapping_add(1);
                    }
                    self.fifo.bitp = 0;
                }
                continue;
            }

            if repeat == 0 {
                continue;
            }

            filt.rpt = repeat as i32;
            filt.clear_delay_lines();

            let i = ((opcode << 3) | (self.mode & 6)) as usize;
            let idx0 = DF_IDX[i];
            let idx1 = DF_IDX[i + 1];
            debug_assert!(idx0 >= 0 && idx1 >= 0 && idx1 >= idx0);
            let (idx0, idx1) = (idx0.max(0) as usize, idx1.max(0) as usize);

            if self.mode & 2 == 0 {
                filt.r[F5 as usize] = 0;
                filt.r[B5 as usize] = 0;
            }

            for cword in &DATAFMT[idx0..=idx1] {
                let cword = *cword;
                let len = cr_len(cword);
                let shf = cr_shf(cword);
                let prm = cr_prm(cword) as usize;
                let clr_l = cword & CR_CLRL != 0;
                let delta = cword & CR_DELTA != 0;
                let field = cword & CR_FIELD != 0;

                if clr_l {
                    filt.r[F0 as usize] = 0;
                    filt.r[B0 as usize] = 0;
                    filt.r[F1 as usize] = 0;
                    filt.r[B1 as usize] = 0;
                    filt.r[F2 as usize] = 0;
                    filt.r[B2 as usize] = 0;
                }

                if len == 0 {
                    continue;
                }

                let mut value = self.getb(len as u32) as i32 as i8 as i32;
                if delta && (value & (1 << (len - 1))) != 0 {
                    value |= -(1i32 << len);
                }
                if shf != 0 {
                    value = if value < 0 { -((-value) << shf) } else { value << shf };
                }

                if field {
                    let keep_mask = !(!0u32 << shf) as u8;
                    filt.r[prm] = (filt.r[prm] & keep_mask) | (value as u8);
                } else if delta {
                    filt.r[prm] = filt.r[prm].wrapping_add(value as u8);
                } else {
                    filt.r[prm] = value as u8;
                }
            }

            if opcode != 0x1 && opcode != 0x2 && opcode != 0x3 {
                filt.r[REG_IA] = 0;
                filt.r[REG_IP] = 0;
            }

            if opcode == 0xF {
                self.silent = true;
                filt.r[REG_AMP] = 0;
                filt.r[REG_PER] = PER_PAUSE as u8;
            } else {
                self.silent = false;
            }

            filt.regdec();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrev_is_involutive() {
        for x in [0u32, 1, 0xFFFF_FFFF, 0x1234_5678, 0x8000_0001, 0xAAAA_AAAA] {
            assert_eq!(bitrev(bitrev(x)), x);
        }
    }

    #[test]
    fn df_idx_slices_are_well_formed_for_data_opcodes() {
        for op in [0x2u32, 0x3, 0x4, 0x5, 0x6, 0x9, 0xA, 0xC, 0xD, 0xE, 0xF] {
            for mode in [0u32, 2, 4, 6] {
                let i = ((op << 3) | (mode & 6)) as usize;
                let idx0 = DF_IDX[i];
                let idx1 = DF_IDX[i + 1];
                assert!(idx0 >= 0 && idx1 >= 0 && idx1 >= idx0, "op={op:#x} mode={mode}");
            }
        }
    }

    #[test]
    fn getb_from_mock_rom_is_lsb_first() {
        let page: [u8; 2] = [0x5A, 0xA5];
        let mut rom: RomPages = [None; 16];
        rom[1] = Some(&page[..]);
        let mut micro = Micro::new(rom);
        micro.pc = 0x1000 << 3; // page 1, bit offset 0
        let mut got = Vec::new();
        for _ in 0..10 {
            got.push(micro.getb(4));
        }
        assert_eq!(got, vec![0xA, 0x5, 0x5, 0xA, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn fifo_entry_with_partial_decle_advances_tail_on_control_transfer() {
        let mut micro = Micro::new([None; 16]);
        micro.fifo_sel = true;
        micro.fifo.head = 2;
        micro.fifo.tail = 0;
        micro.fifo.bitp = 3;
        micro.fifo_sel = micro.pc == FIFO_ADDR; // emulate the post-ctrl_xfer check path
        if micro.fifo.bitp != 0 {
            if micro.fifo.tail < micro.fifo.head {
                micro.fifo.tail += 1;
            }
            micro.fifo.bitp = 0;
        }
        assert_eq!(micro.fifo.tail, 1);
        assert_eq!(micro.fifo.bitp, 0);
    }
}
