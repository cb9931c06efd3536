use crate::{ComputeError, ElementType};

pub const SLOT_INPUT_A: u32 = 0;
pub const SLOT_INPUT_B: u32 = 1;
pub const SLOT_RESULT: u32 = 2;
pub const BINDING_COUNT: usize = 3;

const _: () = assert!(SLOT_RESULT as usize == BINDING_COUNT - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// One binding as a kernel declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDecl {
    pub slot: u32,
    pub access: Access,
    /// `None` when the binding is not an array of a supported scalar.
    pub element: Option<ElementType>,
}

#[must_use]
pub const fn slot_label(slot: u32) -> &'static str {
    match slot {
        SLOT_INPUT_A => "input_a",
        SLOT_INPUT_B => "input_b",
        SLOT_RESULT => "result",
        _ => "unknown",
    }
}

/// The bindings every kernel driven by a [`Dispatcher`](crate::Dispatcher) must declare.
#[must_use]
pub const fn contract(element: ElementType) -> [BindingDecl; BINDING_COUNT] {
    [
        BindingDecl {
            slot: SLOT_INPUT_A,
            access: Access::ReadOnly,
            element: Some(element),
        },
        BindingDecl {
            slot: SLOT_INPUT_B,
            access: Access::ReadOnly,
            element: Some(element),
        },
        BindingDecl {
            slot: SLOT_RESULT,
            access: Access::ReadWrite,
            element: Some(element),
        },
    ]
}

/// Checks declared bindings against [`contract`], in any declaration order.
///
/// # Errors
///
/// Returns [`ComputeError::BindingContract`] naming the first slot that is
/// missing, duplicated, extra, or declared with the wrong access or type.
pub fn verify(
    name: &str,
    element: ElementType,
    declared: &[BindingDecl],
) -> Result<(), ComputeError> {
    let violation = |reason: String| ComputeError::BindingContract {
        name: name.to_string(),
        reason,
    };

    if let Some(extra) = declared.iter().find(|decl| decl.slot as usize >= BINDING_COUNT) {
        return Err(violation(format!("unexpected binding at slot {}", extra.slot)));
    }

    for expected in contract(element) {
        let mut matching = declared.iter().filter(|decl| decl.slot == expected.slot);
        let Some(found) = matching.next() else {
            return Err(violation(format!(
                "slot {} ({}) is not declared",
                expected.slot,
                slot_label(expected.slot)
            )));
        };
        if matching.next().is_some() {
            return Err(violation(format!("slot {} is declared twice", expected.slot)));
        }
        if found.access != expected.access {
            return Err(violation(format!(
                "slot {} ({}) must be {:?}, kernel declares {:?}",
                expected.slot,
                slot_label(expected.slot),
                expected.access,
                found.access
            )));
        }
        if found.element != expected.element {
            return Err(violation(format!(
                "slot {} ({}) must hold {element}, kernel declares {}",
                expected.slot,
                slot_label(expected.slot),
                found.element.map_or_else(|| "an unsupported type".to_string(), |e| e.to_string())
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_itself_verifies() {
        for element in [ElementType::F32, ElementType::I32, ElementType::U32] {
            assert!(verify("add", element, &contract(element)).is_ok());
        }
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let mut decls = contract(ElementType::F32).to_vec();
        decls.reverse();
        assert!(verify("add", ElementType::F32, &decls).is_ok());
    }

    #[test]
    fn swapped_output_slot_is_rejected() {
        let decls = [
            BindingDecl {
                slot: 0,
                access: Access::ReadWrite,
                element: Some(ElementType::F32),
            },
            BindingDecl {
                slot: 1,
                access: Access::ReadOnly,
                element: Some(ElementType::F32),
            },
            BindingDecl {
                slot: 2,
                access: Access::ReadOnly,
                element: Some(ElementType::F32),
            },
        ];
        let err = verify("add", ElementType::F32, &decls).unwrap_err();
        assert!(matches!(err, ComputeError::BindingContract { .. }), "{err:?}");
        assert!(err.to_string().contains("slot 0"), "{err}");
    }

    #[test]
    fn missing_and_extra_slots_are_rejected() {
        let decls = &contract(ElementType::U32)[..2];
        assert!(verify("add", ElementType::U32, decls).is_err());

        let mut decls = contract(ElementType::U32).to_vec();
        decls.push(BindingDecl {
            slot: 3,
            access: Access::ReadOnly,
            element: Some(ElementType::U32),
        });
        assert!(verify("add", ElementType::U32, &decls).is_err());
    }

    #[test]
    fn element_type_must_match_program() {
        let decls = contract(ElementType::I32);
        assert!(verify("add", ElementType::F32, &decls).is_err());
    }
}
