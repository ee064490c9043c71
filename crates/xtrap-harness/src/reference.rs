//! Pure-software implementation of the [`TestKit`] seam.
//!
//! `ReferenceKit` models a small flat machine: 512 KiB of memory, a GDT with
//! well-known flat ring selectors plus scratch slots, per-4K-page presence
//! bits, and ring stacks. Its `run_under_trap` decodes exactly one
//! instruction of the families under test and applies the architectural
//! protection rules from `xtrap_state::protection`, producing the same trap
//! frames real hardware glue would.
//!
//! Faults are atomic: a faulting scenario returns the *input* context
//! unmodified (CR2 aside), matching the hardware fault/succeed contract.

use xtrap_state::descriptor::{system_type, DescriptorSpec, GateSpec};
use xtrap_state::flags::{RFLAGS_NT, RFLAGS_RESERVED1, RFLAGS_RF};
use xtrap_state::mode::{CpuMode, Width};
use xtrap_state::protection::{
    check_byte_range, check_call_gate, check_code_selector, check_stack_selector, is_canonical,
    AccessKind, CodeLoad, Fault, StackLoad,
};
use xtrap_state::regs::{gpr, SegReg};
use xtrap_state::selector::{pf_error_code, Selector, PF_INSTR};
use xtrap_state::tables::TableRegister;
use xtrap_state::trapframe::{Exception, TrapFrame, TrapReason};
use xtrap_state::RegisterContext;

use crate::kit::{CpuFeature, FatalError, PageFlags, PageKind, SetupError, TestKit};

const MEM_SIZE: usize = 0x8_0000;
const PAGE_SIZE: u64 = 0x1000;

const GDT_BASE: u64 = 0x1000;
const GDT_SLOTS: usize = 64;
const IDT_BASE: u64 = 0x2000;

/// First GDT index handed out as a scratch slot.
const SCRATCH_FIRST: usize = 16;
const SCRATCH_COUNT: usize = 32;

/// Ring `r` stack occupies the page below `0x7000 + r * 0x1000`.
const RING0_STACK_TOP: u64 = 0x7000;

/// 64 KiB window backing code pages in 16-bit protected modes, where a
/// 16-bit IP cannot reach the general allocation area. The flat code
/// descriptors for those modes are based at the window start.
const CODE16_WINDOW: u64 = 0x1_0000;

/// First address handed out by the general page allocator.
const ALLOC_BASE: u64 = 0x2_0000;

/// Deliberate misbehaviours for exercising the mismatch-reporting paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sabotage {
    /// Never set descriptor accessed bits.
    DropAccessedBit,
    /// Report every error code as zero.
    ZeroErrorCode,
    /// Report the final RIP off by one.
    SkewRip,
}

#[derive(Debug)]
pub struct ReferenceKit {
    mode: CpuMode,
    mem: Vec<u8>,
    page_flags: Vec<PageFlags>,
    gdtr: TableRegister,
    idtr: TableRegister,
    ring_stacks: [(Selector, u64); 4],
    next_page: u64,
    next_code16: u64,
    dr: [u64; 8],
    post_486: bool,
    amd_far_prefix: bool,
    runs: u64,
    fatal_on_run: Option<u64>,
    sabotage: Option<Sabotage>,
}

impl ReferenceKit {
    pub fn new(mode: CpuMode) -> Self {
        let mut kit = Self {
            mode,
            mem: vec![0; MEM_SIZE],
            page_flags: vec![
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
                MEM_SIZE / PAGE_SIZE as usize
            ],
            gdtr: TableRegister::new(GDT_BASE, (GDT_SLOTS * 8 - 1) as u16),
            idtr: TableRegister::new(IDT_BASE, 0x7FF),
            ring_stacks: [
                (Selector::NULL, 0),
                (Selector::NULL, 0),
                (Selector::NULL, 0),
                (Selector::NULL, 0),
            ],
            next_page: ALLOC_BASE,
            next_code16: CODE16_WINDOW,
            dr: [0; 8],
            post_486: true,
            amd_far_prefix: false,
            runs: 0,
            fatal_on_run: None,
            sabotage: None,
        };
        kit.build_gdt();
        for ring in 0..4u8 {
            kit.ring_stacks[ring as usize] = (
                kit.data_selector(ring),
                RING0_STACK_TOP + ring as u64 * PAGE_SIZE,
            );
        }
        kit
    }

    /// Make run number `n` (1-based) report a double fault.
    pub fn set_fatal_on_run(&mut self, n: u64) {
        self.fatal_on_run = Some(n);
    }

    pub fn set_sabotage(&mut self, sabotage: Option<Sabotage>) {
        self.sabotage = sabotage;
    }

    pub fn set_amd_far_prefix(&mut self, on: bool) {
        self.amd_far_prefix = on;
    }

    /// Code pages for 16-bit protected modes come from a dedicated window so
    /// their offsets under the flat code selectors fit in 16 bits.
    fn code16_window(&self) -> bool {
        self.mode.is_protected() && self.mode.width() == Width::W16
    }

    fn build_gdt(&mut self) {
        let width = self.mode.width();
        let code_base = if self.code16_window() {
            CODE16_WINDOW as u32
        } else {
            0
        };
        for ring in 0..4u8 {
            let mut code = DescriptorSpec {
                granularity: true,
                ..DescriptorSpec::code(code_base, 0xF_FFFF, ring)
            };
            match width {
                Width::W16 => code.default_big = false,
                Width::W32 => {}
                Width::W64 => {
                    code.default_big = false;
                    code.long = true;
                }
            }
            let data = DescriptorSpec {
                granularity: true,
                ..DescriptorSpec::data(0, 0xF_FFFF, ring)
            };
            self.write_gdt_index(1 + 2 * ring as usize, code.encode());
            self.write_gdt_index(2 + 2 * ring as usize, data.encode());
        }
    }

    fn write_gdt_index(&mut self, index: usize, raw: [u8; 8]) {
        let addr = (self.gdtr.base + index as u64 * 8) as usize;
        self.mem[addr..addr + 8].copy_from_slice(&raw);
    }

    fn read_gdt_index(&self, index: usize) -> [u8; 8] {
        let addr = (self.gdtr.base + index as u64 * 8) as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.mem[addr..addr + 8]);
        raw
    }

    fn lookup_raw(&self, sel: Selector) -> Option<[u8; 8]> {
        if sel.is_ldt() {
            return None;
        }
        let off = sel.table_offset();
        if off + 7 > self.gdtr.limit as u64 {
            return None;
        }
        let addr = (self.gdtr.base + off) as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.mem[addr..addr + 8]);
        Some(raw)
    }

    fn lookup_descriptor(&self, sel: Selector) -> Option<DescriptorSpec> {
        self.lookup_raw(sel).map(DescriptorSpec::decode)
    }

    fn mark_accessed(&mut self, sel: Selector) {
        if self.sabotage == Some(Sabotage::DropAccessedBit) {
            return;
        }
        if !self.mode.is_protected() || sel.is_null() {
            return;
        }
        if let Some(mut raw) = self.lookup_raw(sel) {
            raw[5] |= 1;
            let addr = (self.gdtr.base + sel.table_offset()) as usize;
            self.mem[addr..addr + 8].copy_from_slice(&raw);
        }
    }

    fn page_present(&self, linear: u64) -> bool {
        if !self.mode.is_paged() {
            return true;
        }
        let page = (linear / PAGE_SIZE) as usize;
        match self.page_flags.get(page) {
            Some(flags) => flags.contains(PageFlags::PRESENT),
            None => false,
        }
    }

    fn seg_base(&self, sel: Selector) -> u64 {
        if self.mode.is_real_or_v86() {
            return (sel.0 as u64) << 4;
        }
        if self.mode.is_64bit_code() {
            return 0;
        }
        self.lookup_descriptor(sel)
            .map(|d| d.base as u64)
            .unwrap_or(0)
    }

    fn seg_limit(&self, sel: Selector) -> u64 {
        if self.mode.is_real_or_v86() {
            return 0xFFFF;
        }
        if self.mode.is_64bit_code() {
            return u64::MAX;
        }
        self.lookup_descriptor(sel)
            .map(|d| d.effective_limit())
            .unwrap_or(0)
    }

    /// Raw read, zero-filled past the end of backing memory.
    fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let start = addr as usize;
        if start < self.mem.len() {
            let avail = (self.mem.len() - start).min(len);
            out[..avail].copy_from_slice(&self.mem[start..start + avail]);
        }
        out
    }

    fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

// ---------------------------------------------------------------------------
// Instruction decode (only the families under test)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insn {
    StoreTable { idt: bool, offset: u64 },
    LoadTable { idt: bool, offset: u64, width: Width },
    Iret { width: Width },
    RetNear { imm: u16, width: Width },
    RetFar { imm: u16, width: Width },
    JmpRel { rel: i64, width: Width },
    CallRel { rel: i64, width: Width },
    FarDirect { call: bool, sel: Selector, offset: u64, width: Width },
    FarIndirect { call: bool, mem_offset: u64, width: Width },
    Ud2,
}

struct Decoded {
    insn: Insn,
    len: u64,
}

// ---------------------------------------------------------------------------
// Execution

struct Exec<'k> {
    kit: &'k mut ReferenceKit,
    ctx: RegisterContext,
}

impl<'k> Exec<'k> {
    fn mode(&self) -> CpuMode {
        self.kit.mode
    }

    fn user(&self) -> bool {
        self.ctx.cpl == 3
    }

    fn decode(&self) -> Result<Decoded, Fault> {
        let cs_base = self.kit.seg_base(self.ctx.seg(SegReg::Cs));
        let linear = cs_base.wrapping_add(self.ctx.rip());
        let bytes = self.kit.read_bytes(linear, 15);
        let default_width = if self.mode().is_64bit_code() {
            Width::W32
        } else {
            self.mode().width()
        };

        let mut pos = 0usize;
        let mut opsize_prefix = false;
        let mut rex_w = false;
        loop {
            match bytes[pos] {
                0x66 => {
                    opsize_prefix = true;
                    pos += 1;
                }
                0x3E | 0x67 => pos += 1, // DS override / address-size: no effect here
                b @ 0x40..=0x4F if self.mode().is_64bit_code() => {
                    rex_w = (b & 0x08) != 0;
                    pos += 1;
                }
                _ => break,
            }
        }

        let width = if rex_w {
            Width::W64
        } else if opsize_prefix {
            match default_width {
                Width::W16 => Width::W32,
                _ => Width::W16,
            }
        } else {
            default_width
        };
        // Near branches and near RET default to a 64-bit operand in 64-bit
        // code regardless of prefixes.
        let near_width = if self.mode().is_64bit_code() {
            Width::W64
        } else {
            width
        };

        let insn = match bytes[pos] {
            0x0F if bytes[pos + 1] == 0x0B => {
                pos += 2;
                Insn::Ud2
            }
            0x0F if bytes[pos + 1] == 0x01 => {
                pos += 2;
                let reg = (bytes[pos] >> 3) & 7;
                let (offset, npos) = self.parse_mem(&bytes, pos)?;
                pos = npos;
                match reg {
                    0 => Insn::StoreTable { idt: false, offset },
                    1 => Insn::StoreTable { idt: true, offset },
                    2 => Insn::LoadTable { idt: false, offset, width },
                    3 => Insn::LoadTable { idt: true, offset, width },
                    _ => return Err(ud()),
                }
            }
            0xCF => {
                pos += 1;
                Insn::Iret { width }
            }
            0xC3 => {
                pos += 1;
                Insn::RetNear {
                    imm: 0,
                    width: near_width,
                }
            }
            0xC2 => {
                let imm = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]);
                pos += 3;
                Insn::RetNear {
                    imm,
                    width: near_width,
                }
            }
            0xCB => {
                pos += 1;
                Insn::RetFar { imm: 0, width }
            }
            0xCA => {
                let imm = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]);
                pos += 3;
                Insn::RetFar { imm, width }
            }
            0xEB => {
                let rel = bytes[pos + 1] as i8 as i64;
                pos += 2;
                Insn::JmpRel {
                    rel,
                    width: near_width,
                }
            }
            0xE9 => {
                let (rel, n) = read_rel(&bytes, pos + 1, near_width);
                pos = n;
                Insn::JmpRel {
                    rel,
                    width: near_width,
                }
            }
            0xE8 => {
                let (rel, n) = read_rel(&bytes, pos + 1, near_width);
                pos = n;
                Insn::CallRel {
                    rel,
                    width: near_width,
                }
            }
            op @ (0xEA | 0x9A) => {
                if self.mode().is_64bit_code() {
                    return Err(ud());
                }
                let off_len = if width == Width::W32 { 4 } else { 2 };
                let mut off = 0u64;
                for i in 0..off_len {
                    off |= (bytes[pos + 1 + i] as u64) << (i * 8);
                }
                let sel = Selector(u16::from_le_bytes([
                    bytes[pos + 1 + off_len],
                    bytes[pos + 2 + off_len],
                ]));
                pos += 3 + off_len;
                Insn::FarDirect {
                    call: op == 0x9A,
                    sel,
                    offset: off,
                    width,
                }
            }
            0xFF => {
                pos += 1;
                let reg = (bytes[pos] >> 3) & 7;
                let (offset, npos) = self.parse_mem(&bytes, pos)?;
                pos = npos;
                // 64-bit far-branch width: REX.W selects m16:64; the 0x66
                // prefix is honoured only on AMD parts.
                let width = if self.mode().is_64bit_code() {
                    if rex_w {
                        Width::W64
                    } else if opsize_prefix && self.kit.amd_far_prefix {
                        Width::W16
                    } else {
                        Width::W32
                    }
                } else {
                    width
                };
                match reg {
                    3 => Insn::FarIndirect {
                        call: true,
                        mem_offset: offset,
                        width,
                    },
                    5 => Insn::FarIndirect {
                        call: false,
                        mem_offset: offset,
                        width,
                    },
                    _ => return Err(ud()),
                }
            }
            _ => return Err(ud()),
        };

        Ok(Decoded {
            insn,
            len: pos as u64,
        })
    }

    /// ModRM memory forms emitted by the drivers: `[disp16]`/`[bx]` (16-bit),
    /// `[disp32]` (32-bit), `[abs32]` via SIB (64-bit).
    fn parse_mem(&self, bytes: &[u8], pos: usize) -> Result<(u64, usize), Fault> {
        let modrm = bytes[pos];
        let md = modrm >> 6;
        let rm = modrm & 7;
        match self.mode().width() {
            Width::W16 => match (md, rm) {
                (0, 6) => {
                    let disp = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]) as u64;
                    Ok((disp, pos + 3))
                }
                (0, 7) => Ok((self.ctx.gpr[gpr::RBX] & 0xFFFF, pos + 1)),
                _ => Err(ud()),
            },
            Width::W32 => match (md, rm) {
                (0, 5) => {
                    let disp = u32::from_le_bytes([
                        bytes[pos + 1],
                        bytes[pos + 2],
                        bytes[pos + 3],
                        bytes[pos + 4],
                    ]) as u64;
                    Ok((disp, pos + 5))
                }
                _ => Err(ud()),
            },
            Width::W64 => match (md, rm) {
                (0, 4) if bytes[pos + 1] == 0x25 => {
                    let disp = u32::from_le_bytes([
                        bytes[pos + 2],
                        bytes[pos + 3],
                        bytes[pos + 4],
                        bytes[pos + 5],
                    ]) as u64;
                    Ok((disp, pos + 6))
                }
                _ => Err(ud()),
            },
        }
    }

    // -- memory helpers ----------------------------------------------------

    fn check_data(&self, offset: u64, len: u64, kind: AccessKind) -> Result<(), Fault> {
        let sel = self.ctx.seg(SegReg::Ds);
        let base = self.kit.seg_base(sel);
        let limit = self.kit.seg_limit(sel);
        let kit = &self.kit;
        check_byte_range(offset, len, limit, base, false, kind, self.user(), |lin| {
            kit.page_present(lin)
        })
    }

    fn check_stack(&self, sp: u64, len: u64, kind: AccessKind) -> Result<(), Fault> {
        let sel = self.ctx.seg(SegReg::Ss);
        let base = self.kit.seg_base(sel);
        let limit = self.kit.seg_limit(sel);
        let kit = &self.kit;
        check_byte_range(sp, len, limit, base, true, kind, self.user(), |lin| {
            kit.page_present(lin)
        })
    }

    fn stack_read(&self, sp: u64, width: Width) -> Result<u64, Fault> {
        self.check_stack(sp, width.slot_bytes(), AccessKind::Read)?;
        let base = self.kit.seg_base(self.ctx.seg(SegReg::Ss));
        let bytes = self.kit.read_bytes(base.wrapping_add(sp), width.slot_bytes() as usize);
        let mut val = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            val |= (*b as u64) << (i * 8);
        }
        Ok(val)
    }

    fn stack_write(&mut self, sp: u64, width: Width, val: u64) -> Result<(), Fault> {
        self.check_stack(sp, width.slot_bytes(), AccessKind::Write)?;
        let base = self.kit.seg_base(self.ctx.seg(SegReg::Ss));
        let bytes = &val.to_le_bytes()[..width.slot_bytes() as usize];
        self.kit.write_bytes(base.wrapping_add(sp), bytes);
        Ok(())
    }

    fn sp_mask(&self) -> u64 {
        self.mode().width().ip_mask()
    }

    // -- families ----------------------------------------------------------

    fn run(self, decoded: Decoded) -> Result<RegisterContext, Fault> {
        match decoded.insn {
            Insn::Ud2 => Err(ud()),
            Insn::StoreTable { idt, offset } => self.store_table(idt, offset, decoded.len),
            Insn::LoadTable { idt, offset, width } => {
                self.load_table(idt, offset, width, decoded.len)
            }
            Insn::Iret { width } => self.iret(width),
            Insn::RetNear { imm, width } => self.ret_near(imm, width),
            Insn::RetFar { imm, width } => self.ret_far(imm, width),
            Insn::JmpRel { rel, width } => self.near_branch(rel, width, decoded.len, false),
            Insn::CallRel { rel, width } => self.near_branch(rel, width, decoded.len, true),
            Insn::FarDirect { call, sel, offset, width } => {
                self.far_branch(call, sel, offset, width, decoded.len)
            }
            Insn::FarIndirect { call, mem_offset, width } => {
                let ptr_len = width.slot_bytes() + 2;
                self.check_data(mem_offset, ptr_len, AccessKind::Read)?;
                let base = self.kit.seg_base(self.ctx.seg(SegReg::Ds));
                let bytes = self
                    .kit
                    .read_bytes(base.wrapping_add(mem_offset), ptr_len as usize);
                let mut off = 0u64;
                for i in 0..width.slot_bytes() as usize {
                    off |= (bytes[i] as u64) << (i * 8);
                }
                let sel = Selector(u16::from_le_bytes([
                    bytes[width.slot_bytes() as usize],
                    bytes[width.slot_bytes() as usize + 1],
                ]));
                self.far_branch(call, sel, off, width, decoded.len)
            }
        }
    }

    fn store_table(mut self, idt: bool, offset: u64, len: u64) -> Result<RegisterContext, Fault> {
        let reg = if idt { self.kit.idtr } else { self.kit.gdtr };
        let image = reg.to_image(if self.mode().is_64bit_code() {
            Width::W64
        } else {
            Width::W32
        });
        let base = self.kit.seg_base(self.ctx.seg(SegReg::Ds));

        // Byte-by-byte: bytes before the first illegal one are committed, so
        // a straddling store leaves a partial image behind.
        for (i, byte) in image.iter().enumerate() {
            self.check_data(offset.wrapping_add(i as u64), 1, AccessKind::Write)?;
            self.kit
                .write_bytes(base.wrapping_add(offset).wrapping_add(i as u64), &[*byte]);
        }

        self.ctx.set_rip(self.ctx.rip().wrapping_add(len));
        Ok(self.ctx)
    }

    fn load_table(
        mut self,
        idt: bool,
        offset: u64,
        width: Width,
        len: u64,
    ) -> Result<RegisterContext, Fault> {
        // LGDT/LIDT is privileged: CPL must be 0, and V8086 always faults.
        if self.mode().is_v86() || (self.mode().is_protected() && self.ctx.cpl != 0) {
            return Err(Fault::gp0());
        }

        let eff_width = if self.mode().is_64bit_code() {
            Width::W64
        } else {
            width
        };
        let image_len = eff_width.table_image_len() as u64;
        self.check_data(offset, image_len, AccessKind::Read)?;

        let base = self.kit.seg_base(self.ctx.seg(SegReg::Ds));
        let bytes = self
            .kit
            .read_bytes(base.wrapping_add(offset), image_len as usize);
        let value = TableRegister::from_image(&bytes, eff_width);
        if idt {
            self.kit.idtr = value;
        } else {
            self.kit.gdtr = value;
        }

        self.ctx.set_rip(self.ctx.rip().wrapping_add(len));
        Ok(self.ctx)
    }

    fn near_branch(
        mut self,
        rel: i64,
        width: Width,
        len: u64,
        call: bool,
    ) -> Result<RegisterContext, Fault> {
        let next = self.ctx.rip().wrapping_add(len);
        let target = next.wrapping_add(rel as u64) & width.ip_mask();

        if self.mode().is_64bit_code() {
            if !is_canonical(target) {
                return Err(Fault::gp0());
            }
        } else {
            let limit = self.kit.seg_limit(self.ctx.seg(SegReg::Cs));
            if target > limit {
                return Err(Fault::gp0());
            }
        }

        if call {
            let slot = width.slot_bytes();
            let sp = self.ctx.stack_ptr().wrapping_sub(slot) & self.sp_mask();
            self.stack_write(sp, width, next)?;
            self.ctx.set_stack_ptr(sp);
        }

        self.ctx.set_rip(target);
        Ok(self.ctx)
    }

    fn ret_near(mut self, imm: u16, width: Width) -> Result<RegisterContext, Fault> {
        let sp = self.ctx.stack_ptr();
        let target = self.stack_read(sp, width)? & width.ip_mask();

        if self.mode().is_64bit_code() {
            if !is_canonical(target) {
                return Err(Fault::gp0());
            }
        } else {
            let limit = self.kit.seg_limit(self.ctx.seg(SegReg::Cs));
            if target > limit {
                return Err(Fault::gp0());
            }
        }

        self.ctx
            .set_stack_ptr(sp.wrapping_add(width.slot_bytes() + imm as u64) & self.sp_mask());
        self.ctx.set_rip(target);
        Ok(self.ctx)
    }

    fn ret_far(mut self, imm: u16, width: Width) -> Result<RegisterContext, Fault> {
        let slot = width.slot_bytes();
        let sp = self.ctx.stack_ptr();

        let new_ip = self.stack_read(sp, width)? & width.ip_mask();
        let new_cs = Selector(self.stack_read(sp.wrapping_add(slot) & self.sp_mask(), width)? as u16);

        if self.mode().is_real_or_v86() {
            if new_ip > 0xFFFF {
                return Err(Fault::gp0());
            }
            self.ctx.set_seg(SegReg::Cs, new_cs);
            self.ctx.set_rip(new_ip);
            self.ctx
                .set_stack_ptr(sp.wrapping_add(2 * slot + imm as u64) & self.sp_mask());
            return Ok(self.ctx);
        }

        let desc = self.kit.lookup_descriptor(new_cs);
        let new_cpl = check_code_selector(new_cs, desc.as_ref(), self.ctx.cpl, CodeLoad::Return)?;
        let cs_desc = desc.expect("validated descriptor exists");

        if new_cpl > self.ctx.cpl {
            // Outer-ring return: SS:SP are consulted only now, after every CS
            // check has passed.
            let outer_sp_at = sp.wrapping_add(2 * slot + imm as u64) & self.sp_mask();
            let new_sp = self.stack_read(outer_sp_at, width)?;
            let new_ss = Selector(
                self.stack_read(outer_sp_at.wrapping_add(slot) & self.sp_mask(), width)? as u16,
            );
            let ss_desc = self.kit.lookup_descriptor(new_ss);
            check_stack_selector(new_ss, ss_desc.as_ref(), new_cpl, StackLoad::Return)?;

            if self.mode().is_64bit_code() {
                if !is_canonical(new_ip) {
                    return Err(Fault::gp0());
                }
            } else if new_ip > cs_desc.effective_limit() {
                return Err(Fault::gp0());
            }

            self.kit.mark_accessed(new_cs);
            self.kit.mark_accessed(new_ss);
            self.clear_inaccessible_data_segs(new_cpl);
            self.ctx.cpl = new_cpl;
            self.ctx.set_seg(SegReg::Cs, new_cs);
            self.ctx.set_seg(SegReg::Ss, new_ss);
            self.ctx.set_rip(new_ip);
            self.ctx.set_stack_ptr(new_sp & width.ip_mask());
        } else {
            if !self.mode().is_64bit_code() && new_ip > cs_desc.effective_limit() {
                return Err(Fault::gp0());
            }
            if self.mode().is_64bit_code() && !is_canonical(new_ip) {
                return Err(Fault::gp0());
            }
            self.kit.mark_accessed(new_cs);
            self.ctx.set_seg(SegReg::Cs, new_cs);
            self.ctx.set_rip(new_ip);
            self.ctx
                .set_stack_ptr(sp.wrapping_add(2 * slot + imm as u64) & self.sp_mask());
        }
        Ok(self.ctx)
    }

    fn iret(mut self, width: Width) -> Result<RegisterContext, Fault> {
        let slot = width.slot_bytes();
        let sp = self.ctx.stack_ptr();

        let new_ip = self.stack_read(sp, width)?;
        let new_cs = Selector(self.stack_read(sp.wrapping_add(slot) & self.sp_mask(), width)? as u16);
        let new_flags = self.stack_read(sp.wrapping_add(2 * slot) & self.sp_mask(), width)?;

        if self.mode().is_real_or_v86() {
            let merged = (self.ctx.rflags() & !0xFFFF) | (new_flags & 0xFFFF) | RFLAGS_RESERVED1;
            self.ctx.set_rflags(merged);
            self.ctx.set_seg(SegReg::Cs, new_cs);
            self.ctx.set_rip(new_ip & width.ip_mask());
            self.ctx
                .set_stack_ptr(sp.wrapping_add(3 * slot) & self.sp_mask());
            return Ok(self.ctx);
        }

        // 64-bit IRET refuses to load NT=1 on top of NT=1 before any other
        // check, including target-page presence.
        if width == Width::W64
            && self.ctx.get_flag(RFLAGS_NT)
            && (new_flags & RFLAGS_NT) != 0
        {
            return Err(Fault::gp0());
        }

        if self.mode().is_64bit_code() && !is_canonical(new_ip) {
            return Err(Fault::gp0());
        }

        let desc = self.kit.lookup_descriptor(new_cs);
        let new_cpl = check_code_selector(new_cs, desc.as_ref(), self.ctx.cpl, CodeLoad::Return)?;
        let cs_desc = desc.expect("validated descriptor exists");

        // IRETQ always pops SS:RSP; legacy IRET only on an outer-ring return.
        let pops_stack = width == Width::W64 || new_cpl > self.ctx.cpl;
        let (new_sp, new_ss) = if pops_stack {
            let at = sp.wrapping_add(3 * slot) & self.sp_mask();
            let new_sp = self.stack_read(at, width)?;
            let new_ss =
                Selector(self.stack_read(at.wrapping_add(slot) & self.sp_mask(), width)? as u16);
            if new_cpl > self.ctx.cpl || !new_ss.is_null() {
                let ss_desc = self.kit.lookup_descriptor(new_ss);
                check_stack_selector(new_ss, ss_desc.as_ref(), new_cpl, StackLoad::Return)?;
            }
            (Some(new_sp), Some(new_ss))
        } else {
            (None, None)
        };

        if !self.mode().is_64bit_code() && (new_ip & width.ip_mask()) > cs_desc.effective_limit() {
            return Err(Fault::gp0());
        }

        // Target-page presence is checked as part of delivering control.
        let target_linear = cs_desc.base as u64 + (new_ip & width.ip_mask());
        if !self.kit.page_present(target_linear) {
            return Err(Fault {
                exception: Exception::PageFault,
                error_code: pf_error_code(false, false, new_cpl == 3) | PF_INSTR,
                cr2: target_linear,
            });
        }

        let merged = iret_flag_merge(self.ctx.rflags(), new_flags, width, self.ctx.cpl);
        self.kit.mark_accessed(new_cs);
        if new_cpl > self.ctx.cpl {
            self.clear_inaccessible_data_segs(new_cpl);
        }
        self.ctx.set_rflags(merged);
        self.ctx.cpl = new_cpl;
        self.ctx.set_seg(SegReg::Cs, new_cs);
        self.ctx.set_rip(new_ip & width.ip_mask());
        if let (Some(new_sp), Some(new_ss)) = (new_sp, new_ss) {
            self.kit.mark_accessed(new_ss);
            self.ctx.set_seg(SegReg::Ss, new_ss);
            self.ctx.set_stack_ptr(new_sp & width.ip_mask());
        } else {
            self.ctx
                .set_stack_ptr(sp.wrapping_add(3 * slot) & self.sp_mask());
        }
        Ok(self.ctx)
    }

    fn far_branch(
        mut self,
        call: bool,
        sel: Selector,
        offset: u64,
        width: Width,
        len: u64,
    ) -> Result<RegisterContext, Fault> {
        let next = self.ctx.rip().wrapping_add(len);

        if self.mode().is_real_or_v86() {
            let target = offset & width.ip_mask();
            if target > 0xFFFF {
                return Err(Fault::gp0());
            }
            if call {
                let slot = width.slot_bytes();
                let sp1 = self.ctx.stack_ptr().wrapping_sub(slot) & self.sp_mask();
                self.stack_write(sp1, width, self.ctx.seg(SegReg::Cs).0 as u64)?;
                let sp2 = sp1.wrapping_sub(slot) & self.sp_mask();
                self.stack_write(sp2, width, next)?;
                self.ctx.set_stack_ptr(sp2);
            }
            self.ctx.set_seg(SegReg::Cs, sel);
            self.ctx.set_rip(target);
            return Ok(self.ctx);
        }

        if sel.is_null() {
            return Err(Fault::gp0());
        }
        let Some(desc) = self.kit.lookup_descriptor(sel) else {
            return Err(Fault::gp_sel(sel));
        };

        if desc.s {
            // Direct transfer to a code segment.
            let load = if call { CodeLoad::Call } else { CodeLoad::Jmp };
            check_code_selector(sel, Some(&desc), self.ctx.cpl, load)?;

            let target = offset & width.ip_mask();
            if self.mode().is_64bit_code() {
                if !is_canonical(target) {
                    return Err(Fault::gp0());
                }
            } else if target > desc.effective_limit() {
                return Err(Fault::gp0());
            }

            if call {
                let slot = width.slot_bytes();
                let sp1 = self.ctx.stack_ptr().wrapping_sub(slot) & self.sp_mask();
                self.stack_write(sp1, width, self.ctx.seg(SegReg::Cs).0 as u64)?;
                let sp2 = sp1.wrapping_sub(slot) & self.sp_mask();
                self.stack_write(sp2, width, next)?;
                self.ctx.set_stack_ptr(sp2);
            }

            self.kit.mark_accessed(sel);
            self.ctx.set_seg(SegReg::Cs, sel.with_rpl(self.ctx.cpl));
            self.ctx.set_rip(target);
            return Ok(self.ctx);
        }

        // System descriptor: only call gates transfer control here.
        let gate = GateSpec::decode(self.kit.lookup_raw(sel).expect("raw read above"));
        let gate_type_ok = matches!(
            desc.type_code,
            system_type::CALL_GATE16 | system_type::CALL_GATE32
        );
        let (gate_dpl, gate_present) = (desc.dpl, desc.present);
        check_call_gate(sel, gate_type_ok, gate_dpl, gate_present, self.ctx.cpl)?;
        let gate = gate.expect("call gate type checked");

        let gate_width = match gate.kind {
            xtrap_state::descriptor::GateKind::Call16 => Width::W16,
            _ => Width::W32,
        };

        let target_sel = gate.selector;
        if target_sel.is_null() {
            return Err(Fault::gp0());
        }
        let target_desc = self.kit.lookup_descriptor(target_sel);
        let new_cpl = check_code_selector(
            target_sel,
            target_desc.as_ref(),
            self.ctx.cpl,
            CodeLoad::ThroughGate,
        )?;
        let target_desc = target_desc.expect("validated descriptor exists");

        // JMP through a gate must not change privilege.
        if !call && new_cpl != self.ctx.cpl {
            return Err(Fault::gp_sel(target_sel));
        }

        let target = (gate.offset as u64) & gate_width.ip_mask();
        if target > target_desc.effective_limit() {
            return Err(Fault::gp0());
        }

        if call && new_cpl < self.ctx.cpl {
            // Inner-ring call: switch to the TSS-provided stack.
            let (new_ss, new_sp_top) = self.kit.ring_stack(new_cpl);
            let ss_desc = self.kit.lookup_descriptor(new_ss);
            check_stack_selector(new_ss, ss_desc.as_ref(), new_cpl, StackLoad::TssSwitch)?;

            let old_ss = self.ctx.seg(SegReg::Ss);
            let old_sp = self.ctx.stack_ptr();
            let old_cs = self.ctx.seg(SegReg::Cs);

            // Pushes land on the new stack.
            self.ctx.set_seg(SegReg::Ss, new_ss);
            self.ctx.cpl = new_cpl;
            let slot = gate_width.slot_bytes();
            let mut sp = new_sp_top;
            for val in [old_ss.0 as u64, old_sp, old_cs.0 as u64, next] {
                sp = sp.wrapping_sub(slot) & gate_width.ip_mask();
                if let Err(fault) = self.stack_write(sp, gate_width, val) {
                    return Err(fault);
                }
            }
            self.ctx.set_stack_ptr(sp);

            self.kit.mark_accessed(target_sel);
            self.kit.mark_accessed(new_ss);
            self.ctx
                .set_seg(SegReg::Cs, target_sel.with_rpl(new_cpl));
            self.ctx.set_rip(target);
            return Ok(self.ctx);
        }

        if call {
            let slot = gate_width.slot_bytes();
            let sp1 = self.ctx.stack_ptr().wrapping_sub(slot) & self.sp_mask();
            self.stack_write(sp1, gate_width, self.ctx.seg(SegReg::Cs).0 as u64)?;
            let sp2 = sp1.wrapping_sub(slot) & self.sp_mask();
            self.stack_write(sp2, gate_width, next)?;
            self.ctx.set_stack_ptr(sp2);
        }

        self.kit.mark_accessed(target_sel);
        self.ctx
            .set_seg(SegReg::Cs, target_sel.with_rpl(self.ctx.cpl));
        self.ctx.set_rip(target);
        Ok(self.ctx)
    }

    /// On a transfer to a less privileged ring, data segment registers whose
    /// descriptors the new ring may not access are forced to null.
    fn clear_inaccessible_data_segs(&mut self, new_cpl: u8) {
        for reg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            let sel = self.ctx.seg(reg);
            if sel.is_null() {
                continue;
            }
            let Some(desc) = self.kit.lookup_descriptor(sel) else {
                continue;
            };
            let accessible = desc.is_conforming_code() || desc.dpl >= new_cpl;
            if !accessible {
                self.ctx.set_seg(reg, Selector::NULL);
            }
        }
    }
}

/// IRET flag-restore rules shared with the expectation model.
pub fn iret_flag_merge(old: u64, popped: u64, width: Width, old_cpl: u8) -> u64 {
    use xtrap_state::flags::{RFLAGS_IF, RFLAGS_IOPL_MASK};

    let mask = match width {
        Width::W16 => 0xFFFFu64,
        Width::W32 => 0xFFFF_FFFF,
        Width::W64 => u64::MAX,
    };
    let mut merged = (old & !mask) | (popped & mask);
    if old_cpl > 0 {
        // IOPL changes are ring-0 only; IF changes need CPL <= IOPL.
        merged = (merged & !RFLAGS_IOPL_MASK) | (old & RFLAGS_IOPL_MASK);
        let iopl = xtrap_state::flags::iopl(old);
        if old_cpl > iopl {
            merged = (merged & !RFLAGS_IF) | (old & RFLAGS_IF);
        }
    }
    // RF and VM are never restored from a same-width legacy frame in our
    // scenarios; reserved bit 1 is always set.
    (merged | RFLAGS_RESERVED1) & !RFLAGS_RF
}

fn ud() -> Fault {
    Fault {
        exception: Exception::InvalidOpcode,
        error_code: 0,
        cr2: 0,
    }
}

fn read_rel(bytes: &[u8], pos: usize, width: Width) -> (i64, usize) {
    match width {
        Width::W16 => (
            i16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as i64,
            pos + 2,
        ),
        _ => (
            i32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as i64,
            pos + 4,
        ),
    }
}

impl TestKit for ReferenceKit {
    fn capture_context(&mut self, mode: CpuMode, extra_stack: u16) -> RegisterContext {
        let mut ctx = RegisterContext::new(mode);
        if mode.is_real_or_v86() {
            ctx.set_seg(SegReg::Cs, Selector(0));
            ctx.set_seg(SegReg::Ss, Selector(0));
            ctx.set_seg(SegReg::Ds, Selector(0));
            ctx.set_seg(SegReg::Es, Selector(0));
            ctx.cpl = if mode.is_v86() { 3 } else { 0 };
        } else {
            ctx.set_seg(SegReg::Cs, self.code_selector(0));
            ctx.set_seg(SegReg::Ss, self.data_selector(0));
            ctx.set_seg(SegReg::Ds, self.data_selector(0));
            ctx.set_seg(SegReg::Es, self.data_selector(0));
            ctx.cpl = 0;
        }
        ctx.set_stack_ptr(RING0_STACK_TOP - extra_stack as u64);
        ctx.cr0 = if mode.is_protected() { 1 } else { 0 };
        ctx
    }

    fn run_under_trap(&mut self, ctx: &RegisterContext) -> Result<TrapFrame, FatalError> {
        self.runs += 1;
        if self.fatal_on_run == Some(self.runs) {
            return Err(FatalError::DoubleFault);
        }

        let exec = Exec {
            kit: self,
            ctx: ctx.clone(),
        };
        let decoded = match exec.decode() {
            Ok(d) => d,
            Err(fault) => {
                return Ok(self.fault_frame(ctx, fault));
            }
        };
        let exec = Exec {
            kit: self,
            ctx: ctx.clone(),
        };
        match exec.run(decoded) {
            Ok(final_ctx) => {
                // The next fetch lands on the snippet's UD2; report it as the
                // #UD the harness classifies.
                let mut frame = self.fault_frame_with_ctx(final_ctx, ud());
                if self.sabotage == Some(Sabotage::SkewRip) {
                    let rip = frame.ctx.rip();
                    frame.ctx.set_rip(rip.wrapping_add(1));
                }
                Ok(frame)
            }
            Err(fault) => Ok(self.fault_frame(ctx, fault)),
        }
    }

    fn alloc_page(&mut self, kind: PageKind) -> Result<u64, SetupError> {
        if kind == PageKind::Code && self.code16_window() {
            if self.next_code16 + PAGE_SIZE > CODE16_WINDOW + 0x1_0000 {
                return Err(SetupError::AllocFailed);
            }
            let addr = self.next_code16;
            self.next_code16 += PAGE_SIZE;
            return Ok(addr);
        }
        if self.next_page + PAGE_SIZE > MEM_SIZE as u64 {
            return Err(SetupError::AllocFailed);
        }
        let addr = self.next_page;
        self.next_page += PAGE_SIZE;
        Ok(addr)
    }

    fn protect_page(
        &mut self,
        addr: u64,
        len: u64,
        set: PageFlags,
        clear: PageFlags,
    ) -> Result<(), SetupError> {
        let first = addr / PAGE_SIZE;
        let last = (addr + len.max(1) - 1) / PAGE_SIZE;
        for page in first..=last {
            let Some(flags) = self.page_flags.get_mut(page as usize) else {
                return Err(SetupError::AllocFailed);
            };
            flags.insert(set);
            flags.remove(clear);
        }
        Ok(())
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) {
        let start = addr as usize;
        buf.copy_from_slice(&self.mem[start..start + buf.len()]);
    }

    fn write_mem(&mut self, addr: u64, bytes: &[u8]) {
        self.write_bytes(addr, bytes);
    }

    fn code_selector(&self, ring: u8) -> Selector {
        Selector::new(1 + 2 * ring as u16, false, ring)
    }

    fn code_offset(&self, addr: u64) -> u64 {
        if self.mode.is_real_or_v86() {
            addr & 0xF
        } else if self.code16_window() {
            addr - CODE16_WINDOW
        } else {
            addr
        }
    }

    fn data_selector(&self, ring: u8) -> Selector {
        Selector::new(2 + 2 * ring as u16, false, ring)
    }

    fn scratch_slot_count(&self) -> usize {
        SCRATCH_COUNT
    }

    fn scratch_selector(&self, slot: usize) -> Selector {
        Selector::new((SCRATCH_FIRST + slot) as u16, false, 0)
    }

    fn read_gdt_slot(&mut self, slot: usize) -> [u8; 8] {
        self.read_gdt_index(SCRATCH_FIRST + slot)
    }

    fn write_gdt_slot(&mut self, slot: usize, raw: [u8; 8]) {
        self.write_gdt_index(SCRATCH_FIRST + slot, raw);
    }

    fn gdtr(&self) -> TableRegister {
        self.gdtr
    }

    fn idtr(&self) -> TableRegister {
        self.idtr
    }

    fn set_gdtr(&mut self, reg: TableRegister) {
        self.gdtr = reg;
    }

    fn set_idtr(&mut self, reg: TableRegister) {
        self.idtr = reg;
    }

    fn ring_stack(&self, ring: u8) -> (Selector, u64) {
        self.ring_stacks[ring as usize]
    }

    fn set_ring_stack(&mut self, ring: u8, sel: Selector, sp: u64) {
        self.ring_stacks[ring as usize] = (sel, sp);
    }

    fn has_feature(&self, feature: CpuFeature) -> bool {
        match feature {
            CpuFeature::LongMode => true,
            CpuFeature::Post486Rf => self.post_486,
            CpuFeature::AmdFarBranchPrefix => self.amd_far_prefix,
        }
    }

    fn reset_debug_regs(&mut self) {
        self.dr = [0; 8];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xtrap_state::selector::PF_INSTR;

    const CODE_AT: u64 = 0x4000;

    fn ctx_at(kit: &mut ReferenceKit, mode: CpuMode, rip: u64) -> RegisterContext {
        let mut ctx = kit.capture_context(mode, 0);
        ctx.set_rip(rip);
        ctx
    }

    #[test]
    fn sidt_stores_exactly_six_bytes() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        // sidt [0x5000]
        kit.write_mem(CODE_AT, &[0x0F, 0x01, 0x0D, 0x00, 0x50, 0x00, 0x00]);
        kit.write_mem(0x5000, &[0xAA; 8]);
        let ctx = ctx_at(&mut kit, CpuMode::Prot32, CODE_AT);

        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_eq!(frame.reason, TrapReason::Exception(Exception::InvalidOpcode));
        assert_eq!(frame.ctx.rip(), CODE_AT + 7);

        let mut buf = [0u8; 7];
        kit.read_mem(0x5000, &mut buf);
        assert_eq!(&buf[..6], kit.idtr().to_image(Width::W32).as_slice());
        // The guard byte past the image is untouched.
        assert_eq!(buf[6], 0xAA);
    }

    #[test]
    fn lgdt_from_ring3_is_gp0_and_leaves_state() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        // lgdt [0x5000]
        kit.write_mem(CODE_AT, &[0x0F, 0x01, 0x15, 0x00, 0x50, 0x00, 0x00]);
        let mut ctx = ctx_at(&mut kit, CpuMode::Prot32, CODE_AT);
        ctx.set_seg(SegReg::Cs, kit.code_selector(3));
        ctx.set_seg(SegReg::Ss, kit.data_selector(3));
        ctx.set_seg(SegReg::Ds, kit.data_selector(3));
        ctx.cpl = 3;

        let before = kit.gdtr();
        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_eq!(
            frame.reason,
            TrapReason::Exception(Exception::GeneralProtection)
        );
        assert_eq!(frame.error_code, 0);
        assert_eq!(frame.ctx.rip(), CODE_AT);
        assert_eq!(kit.gdtr(), before);
    }

    #[test]
    fn near_ret_pops_the_return_address() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        kit.write_mem(CODE_AT, &[0xC3]);
        kit.write_mem(0x6FFC, &0x4100u32.to_le_bytes());
        let mut ctx = ctx_at(&mut kit, CpuMode::Prot32, CODE_AT);
        ctx.set_stack_ptr(0x6FFC);

        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_eq!(frame.reason, TrapReason::Exception(Exception::InvalidOpcode));
        assert_eq!(frame.ctx.rip(), 0x4100);
        assert_eq!(frame.ctx.stack_ptr(), 0x7000);
    }

    fn iretq_frame(kit: &mut ReferenceKit, sp: u64, rip: u64, rflags: u64) {
        let cs = kit.code_selector(0).0 as u64;
        let ss = kit.data_selector(0).0 as u64;
        for (i, val) in [rip, cs, rflags, 0x7000, ss].into_iter().enumerate() {
            kit.write_mem(sp + 8 * i as u64, &val.to_le_bytes());
        }
    }

    #[test]
    fn iretq_nested_task_flag_wins_over_page_fault() {
        let mut kit = ReferenceKit::new(CpuMode::Long64);
        kit.write_mem(CODE_AT, &[0x48, 0xCF]); // iretq
        kit.protect_page(0x2_0000, 0x1000, PageFlags::empty(), PageFlags::PRESENT)
            .unwrap();
        iretq_frame(&mut kit, 0x6FD8, 0x2_0000, RFLAGS_RESERVED1 | RFLAGS_NT);

        let mut ctx = ctx_at(&mut kit, CpuMode::Long64, CODE_AT);
        ctx.set_stack_ptr(0x6FD8);
        ctx.set_flag(RFLAGS_NT, true);

        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_eq!(
            frame.reason,
            TrapReason::Exception(Exception::GeneralProtection)
        );
        assert_eq!(frame.error_code, 0);
    }

    #[test]
    fn iretq_without_nt_conflict_reports_the_fetch_page_fault() {
        let mut kit = ReferenceKit::new(CpuMode::Long64);
        kit.write_mem(CODE_AT, &[0x48, 0xCF]);
        kit.protect_page(0x2_0000, 0x1000, PageFlags::empty(), PageFlags::PRESENT)
            .unwrap();
        iretq_frame(&mut kit, 0x6FD8, 0x2_0000, RFLAGS_RESERVED1 | RFLAGS_NT);

        let mut ctx = ctx_at(&mut kit, CpuMode::Long64, CODE_AT);
        ctx.set_stack_ptr(0x6FD8);

        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_eq!(frame.reason, TrapReason::Exception(Exception::PageFault));
        assert_eq!(frame.cr2, 0x2_0000);
        assert_eq!(frame.error_code, PF_INSTR);
    }

    #[test]
    fn fault_entry_sets_rf_on_post_486() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        kit.write_mem(CODE_AT, &[0x0F, 0x0B]);
        let ctx = ctx_at(&mut kit, CpuMode::Prot32, CODE_AT);
        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_ne!(frame.handler_rflags & RFLAGS_RF, 0);
    }

    #[test]
    fn skew_rip_sabotage_perturbs_success_frames_only() {
        let mut kit = ReferenceKit::new(CpuMode::Prot32);
        kit.set_sabotage(Some(Sabotage::SkewRip));
        kit.write_mem(CODE_AT, &[0xEB, 0x06]); // jmp short +6
        let ctx = ctx_at(&mut kit, CpuMode::Prot32, CODE_AT);
        let frame = kit.run_under_trap(&ctx).unwrap();
        assert_eq!(frame.ctx.rip(), CODE_AT + 8 + 1);
    }
}

impl ReferenceKit {
    fn fault_frame(&self, ctx: &RegisterContext, fault: Fault) -> TrapFrame {
        self.fault_frame_with_ctx(ctx.clone(), fault)
    }

    fn fault_frame_with_ctx(&self, mut ctx: RegisterContext, fault: Fault) -> TrapFrame {
        ctx.cr2 = fault.cr2;
        let handler_rflags = if self.post_486 {
            ctx.rflags() | RFLAGS_RF
        } else {
            ctx.rflags()
        };
        let error_code = if self.sabotage == Some(Sabotage::ZeroErrorCode) {
            0
        } else {
            fault.error_code
        };
        TrapFrame {
            reason: TrapReason::Exception(fault.exception),
            error_code,
            cr2: fault.cr2,
            ctx,
            handler_cs: self.code_selector(0),
            handler_ss: self.data_selector(0),
            handler_rflags,
        }
    }
}
