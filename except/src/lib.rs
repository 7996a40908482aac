//! Architectural exception delivery: the double-fault algebra
//!, real-mode vectoring (`real_mode`),
//! protected-mode vectoring (`protected_mode`), and the descriptor
//! plumbing both share (`descriptor`). This module ties the three
//! together into `raise_exception`, the entry point the dispatch loop
//! and emitted code both call.

pub mod dbl_fault;
pub mod descriptor;
pub mod protected_mode;
pub mod real_mode;

use log::{error, warn};

use lib86_core::{CpuCtx, CpuError, ExpData, GuestMemory, HFlags, Lib86Status};

pub use dbl_fault::Escalation;

/// Upper bound on the re-delivery loop below. The double-fault rules
/// are provable to settle within two escalations (benign -> #DF on a
/// second contributory/#PF, then the next `previous_vector == #DF`
/// check catches a third); this is a backstop against a logic error
/// turning into an infinite loop rather than a reachable guest state.
const MAX_DELIVERY_ITERATIONS: usize = 8;

/// Deliver an architectural exception, applying the double-fault
/// escalation rules and re-entering delivery as many times as a fault
/// raised *by* delivery itself requires.
///
/// Delivery is naturally recursive (a fault raised while delivering
/// another fault re-enters delivery), but it is written here as a
/// bounded loop so re-delivery never grows the host stack.
pub fn raise_exception<M: GuestMemory>(
    cpu: &mut CpuCtx,
    mem: &mut M,
    mut current: ExpData,
    is_software_int: bool,
) -> Result<(), CpuError> {
    for _ in 0..MAX_DELIVERY_ITERATIONS {
        let escalation = dbl_fault::evaluate(&cpu.exp, current.vector);
        let (vector, zero_context) = match escalation {
            Escalation::TripleFault => {
                error!(target: "lib86_except", "triple fault at eip={:#x}", current.eip);
                return Err(CpuError::triple_fault());
            }
            Escalation::Deliver {
                vector,
                zero_context,
            } => (vector, zero_context),
        };
        if zero_context {
            current.vector = vector;
            current.code = 0;
            current.eip = 0;
        }
        if dbl_fault::updates_previous(vector) {
            cpu.exp.previous_vector = vector;
        }

        let delivery = if cpu.hflags.is_protected_mode() {
            protected_mode::deliver(cpu, mem, &current, is_software_int, zero_context)
        } else {
            real_mode::deliver(cpu, mem, &current, zero_context)
        };

        match delivery {
            Ok(()) => {
                // A successful delivery resets `previous_vector` to
                // `INVALID` on both the real-mode and protected-mode
                // paths.
                cpu.exp.previous_vector = lib86_core::INVALID_VECTOR;
                return Ok(());
            }
            Err((next_vector, next_code)) => {
                warn!(
                    target: "lib86_except",
                    "fault {} raised while delivering {}, re-entering",
                    next_vector, vector
                );
                current = ExpData {
                    fault_addr: current.fault_addr,
                    code: next_code,
                    vector: next_vector,
                    eip: current.eip,
                };
                cpu.hflags.remove(HFlags::DBG_TRAP);
                continue;
            }
        }
    }

    Err(CpuError::new(
        Lib86Status::InternalError,
        "exception delivery did not converge within the iteration bound",
    ))
}
