use lib86_core::GuestMemory;

/// Selector's table-indicator bit: 0 = GDT, 1 = LDT.
const SEL_TI: u16 = 1 << 2;
pub const SEL_RPL_MASK: u16 = 0b11;

/// Read the raw 8-byte descriptor `selector` addresses, from the GDT
/// or LDT as indicated by the selector's TI bit.
pub fn read_raw<M: GuestMemory>(
    mem: &mut M,
    gdtr_base: u32,
    gdtr_limit: u32,
    ldtr_base: u32,
    ldtr_limit: u32,
    selector: u16,
    eip: u32,
) -> Result<[u8; 8], DescError> {
    let index = (selector & !(SEL_TI | SEL_RPL_MASK)) as u32;
    let (table_base, table_limit) = if selector & SEL_TI != 0 {
        (ldtr_base, ldtr_limit)
    } else {
        (gdtr_base, gdtr_limit)
    };
    if index + 7 > table_limit {
        return Err(DescError::Limit);
    }
    let virt = table_base.wrapping_add(index);
    let lo_phys = mem
        .get_read_addr(virt, 4, eip)
        .map_err(DescError::Fault)?;
    let lo = mem.mem_read(lo_phys, 4);
    let hi_phys = mem
        .get_read_addr(virt + 4, 4, eip)
        .map_err(DescError::Fault)?;
    let hi = mem.mem_read(hi_phys, 4);
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&lo.to_le_bytes());
    bytes[4..8].copy_from_slice(&hi.to_le_bytes());
    Ok(bytes)
}

/// Read the raw 8-byte gate descriptor for `vector` out of the IDT.
/// Unlike [`read_raw`], there is no GDT/LDT table-indicator bit to
/// resolve: the IDT is the only table a vector can name, and the
/// caller has already checked `vector * 8 + 7` against `idtr_limit`.
pub fn read_idt_gate<M: GuestMemory>(mem: &mut M, idtr_base: u32, vector: u16, eip: u32) -> Result<[u8; 8], DescError> {
    let virt = idtr_base.wrapping_add((vector as u32) * 8);
    let lo_phys = mem.get_read_addr(virt, 4, eip).map_err(DescError::Fault)?;
    let lo = mem.mem_read(lo_phys, 4);
    let hi_phys = mem.get_read_addr(virt + 4, 4, eip).map_err(DescError::Fault)?;
    let hi = mem.mem_read(hi_phys, 4);
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&lo.to_le_bytes());
    bytes[4..8].copy_from_slice(&hi.to_le_bytes());
    Ok(bytes)
}

/// Set the accessed bit (bit 0 of the access byte) on the descriptor
/// `selector` addresses, read-modify-write in guest memory.
pub fn set_accessed<M: GuestMemory>(
    mem: &mut M,
    gdtr_base: u32,
    gdtr_limit: u32,
    ldtr_base: u32,
    ldtr_limit: u32,
    selector: u16,
    eip: u32,
) -> Result<(), DescError> {
    let index = (selector & !(SEL_TI | SEL_RPL_MASK)) as u32;
    let (table_base, table_limit) = if selector & SEL_TI != 0 {
        (ldtr_base, ldtr_limit)
    } else {
        (gdtr_base, gdtr_limit)
    };
    if index + 7 > table_limit {
        return Err(DescError::Limit);
    }
    let access_virt = table_base.wrapping_add(index) + 5;
    let phys = mem
        .get_write_addr(access_virt, 1, eip)
        .map_err(DescError::Fault)?
        .0;
    let cur = mem.mem_read(phys, 1);
    mem.mem_write(phys, 1, cur | 0x01);
    Ok(())
}

#[derive(Debug)]
pub enum DescError {
    /// The selector's index falls outside the table's limit.
    Limit,
    Fault(lib86_core::HostEvent),
}

/// A segment descriptor's decoded fields, common to code and data
/// descriptors.
#[derive(Debug, Clone, Copy)]
pub struct SegDescriptor {
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
}

impl SegDescriptor {
    pub fn parse(raw: [u8; 8]) -> Self {
        let limit_lo = u16::from_le_bytes([raw[0], raw[1]]) as u32;
        let base_lo = u16::from_le_bytes([raw[2], raw[3]]) as u32;
        let base_mid = raw[4] as u32;
        let access = raw[5];
        let limit_hi_flags = raw[6];
        let base_hi = raw[7] as u32;
        let limit = limit_lo | (((limit_hi_flags & 0x0F) as u32) << 16);
        let base = base_lo | (base_mid << 16) | (base_hi << 24);
        Self {
            base,
            limit,
            access,
            flags: limit_hi_flags >> 4,
        }
    }

    pub fn present(self) -> bool {
        self.access & 0x80 != 0
    }

    pub fn dpl(self) -> u8 {
        (self.access >> 5) & 0b11
    }

    /// Descriptor type bit: 1 = code/data, 0 = system.
    pub fn is_code_or_data(self) -> bool {
        self.access & 0x10 != 0
    }

    pub fn is_writable_data(self) -> bool {
        self.is_code_or_data() && (self.access & 0b1000) == 0 && (self.access & 0b10) != 0
    }

    /// The `B` (big) bit for a data/stack segment: 32-bit operand
    /// size when set.
    pub fn is_32bit(self) -> bool {
        self.flags & 0b0100 != 0
    }
}

/// Gate-descriptor kinds the IDT's type field selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Task,
    Interrupt16,
    Interrupt32,
    Trap16,
    Trap32,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
pub struct GateDescriptor {
    pub offset: u32,
    pub selector: u16,
    pub present: bool,
    pub dpl: u8,
    pub kind: GateKind,
}

impl GateDescriptor {
    pub fn parse(raw: [u8; 8]) -> Self {
        let offset_lo = u16::from_le_bytes([raw[0], raw[1]]) as u32;
        let selector = u16::from_le_bytes([raw[2], raw[3]]);
        let type_attr = raw[5];
        let offset_hi = u16::from_le_bytes([raw[6], raw[7]]) as u32;
        let present = type_attr & 0x80 != 0;
        let dpl = (type_attr >> 5) & 0b11;
        let kind = match type_attr & 0x0F {
            0x5 => GateKind::Task,
            0x6 => GateKind::Interrupt16,
            0x7 => GateKind::Trap16,
            0xE => GateKind::Interrupt32,
            0xF => GateKind::Trap32,
            _ => GateKind::Invalid,
        };
        let offset = match kind {
            GateKind::Interrupt16 | GateKind::Trap16 => offset_lo,
            _ => offset_lo | (offset_hi << 16),
        };
        Self {
            offset,
            selector,
            present,
            dpl,
            kind,
        }
    }

    pub fn is_32bit(self) -> bool {
        matches!(self.kind, GateKind::Interrupt32 | GateKind::Trap32)
    }

    /// Whether the handler runs with IF masked (interrupt gates only;
    /// trap gates leave IF alone).
    pub fn masks_if(self) -> bool {
        matches!(self.kind, GateKind::Interrupt16 | GateKind::Interrupt32)
    }
}
