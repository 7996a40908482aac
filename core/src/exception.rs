//! Exception vector numbers and the in-flight exception record
//!. The delivery algorithm itself lives in
//! the `lib86-except` crate; this module only carries shared state
//! and the vector classification used by double-fault detection.

/// Architectural exception vectors this engine delivers. Hardware
/// interrupts and task gates are a non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    De = 0,
    Db = 1,
    Nmi = 2,
    Bp = 3,
    Of = 4,
    Br = 5,
    Ud = 6,
    Nm = 7,
    Df = 8,
    Ts = 10,
    Np = 11,
    Ss = 12,
    Gp = 13,
    Pf = 14,
    Mf = 16,
    Ac = 17,
}

impl Vector {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Exception vectors that push an error code onto the stack
    /// during delivery.
    pub fn has_error_code(idx: u16) -> bool {
        matches!(
            idx,
            x if x == Self::Df.as_u16()
                || x == Self::Ts.as_u16()
                || x == Self::Np.as_u16()
                || x == Self::Ss.as_u16()
                || x == Self::Gp.as_u16()
                || x == Self::Pf.as_u16()
                || x == Self::Ac.as_u16()
        )
    }
}

/// No exception is currently pending / `previous-vector` has been
/// reset.
pub const INVALID_VECTOR: u16 = u16::MAX;

/// Whether `vector` is in the "contributory" class used by the
/// double-fault algebra: `#DE` or any of `#TS`..`#GP`.
pub fn is_contributory(vector: u16) -> bool {
    vector == Vector::De.as_u16() || (Vector::Ts.as_u16()..=Vector::Gp.as_u16()).contains(&vector)
}

/// The data describing an exception in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpData {
    /// Only meaningful for `#PF`.
    pub fault_addr: u32,
    pub code: u16,
    pub vector: u16,
    /// Guest EIP of the instruction that raised the exception.
    pub eip: u32,
}

/// The in-flight exception record. `previous_vector` persists across
/// the bounded re-delivery loop in `raise_exception` and is the only
/// state double-fault detection needs.
#[derive(Debug, Clone, Copy)]
pub struct ExpInfo {
    pub data: ExpData,
    pub previous_vector: u16,
}

impl ExpInfo {
    pub const fn new() -> Self {
        Self {
            data: ExpData {
                fault_addr: 0,
                code: 0,
                vector: 0,
                eip: 0,
            },
            previous_vector: INVALID_VECTOR,
        }
    }
}

impl Default for ExpInfo {
    fn default() -> Self {
        Self::new()
    }
}
