use lib86_core::{is_contributory, ExpInfo, Vector, INVALID_VECTOR};

/// Outcome of applying the double-fault rules to a newly raised
/// exception against the pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Deliver `vector` (possibly replaced) with `error_code`/`eip`
    /// zeroed if escalation happened.
    Deliver { vector: u16, zero_context: bool },
    /// The guest triple-faulted; the session must abort.
    TripleFault,
}

/// Evaluate the double-fault rules before delivering `current`,
/// given the persisted `previous_vector` in `exp`.
///
/// Rules, in order:
/// - `previous_vector == #DF` => triple fault.
/// - `(previous contributory && current contributory)` or
///   `(previous == #PF && current in contributory ∪ {#PF})` =>
///   escalate to `#DF`.
/// - Otherwise deliver `current` unchanged.
pub fn evaluate(exp: &ExpInfo, current_vector: u16) -> Escalation {
    let previous = exp.previous_vector;
    if previous == Vector::Df.as_u16() {
        return Escalation::TripleFault;
    }

    let prev_contributory = previous != INVALID_VECTOR && is_contributory(previous);
    let prev_is_pf = previous == Vector::Pf.as_u16();
    let current_contributory = is_contributory(current_vector);
    let current_is_pf = current_vector == Vector::Pf.as_u16();

    let escalate = (prev_contributory && current_contributory)
        || (prev_is_pf && (current_contributory || current_is_pf));

    if escalate {
        Escalation::Deliver {
            vector: Vector::Df.as_u16(),
            zero_context: true,
        }
    } else {
        Escalation::Deliver {
            vector: current_vector,
            zero_context: false,
        }
    }
}

/// Whether `vector` (the one actually delivered, after escalation)
/// should update `previous_vector` for the next evaluation.
pub fn updates_previous(vector: u16) -> bool {
    is_contributory(vector) || vector == Vector::Pf.as_u16() || vector == Vector::Df.as_u16()
}
