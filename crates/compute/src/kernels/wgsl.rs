//! Front-end checks for WGSL kernels, run before anything reaches a GPU.

use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, ScalarKind, ShaderStage, StorageAccess, TypeInner};

use crate::layout::{Access, BindingDecl};
use crate::{ComputeError, ElementType};

pub const ENTRY_POINT: &str = "main";

/// A WGSL kernel that parsed and validated, with what it declares.
#[derive(Debug)]
pub struct ValidatedShader {
    pub workgroup_size: [u32; 3],
    pub bindings: Vec<BindingDecl>,
}

/// Parses and validates `source`, then reflects the bindings of bind group 0.
///
/// # Errors
///
/// [`ComputeError::Compilation`] with the rendered diagnostic when parsing or
/// validation fails, when there is no `@compute fn main`, or when the shader
/// uses a bind group other than 0.
pub fn validate(name: &str, source: &str) -> Result<ValidatedShader, ComputeError> {
    let compilation = |reason: String| ComputeError::Compilation {
        name: name.to_string(),
        reason,
    };

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| compilation(e.emit_to_string(source)))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| compilation(e.emit_to_string(source)))?;

    let entry = module
        .entry_points
        .iter()
        .find(|entry| entry.name == ENTRY_POINT && entry.stage == ShaderStage::Compute)
        .ok_or_else(|| compilation(format!("no compute entry point `{ENTRY_POINT}`")))?;

    let mut bindings = Vec::new();
    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else { continue };
        if binding.group != 0 {
            return Err(compilation(format!(
                "binding {} lives in bind group {}, only group 0 is bound",
                binding.binding, binding.group
            )));
        }
        let access = match var.space {
            AddressSpace::Storage { access } if access.contains(StorageAccess::STORE) => {
                Access::ReadWrite
            }
            _ => Access::ReadOnly,
        };
        let element = match var.space {
            AddressSpace::Storage { .. } => array_element(&module, var.ty),
            _ => None,
        };
        bindings.push(BindingDecl {
            slot: binding.binding,
            access,
            element,
        });
    }

    Ok(ValidatedShader {
        workgroup_size: entry.workgroup_size,
        bindings,
    })
}

fn array_element(module: &naga::Module, ty: naga::Handle<naga::Type>) -> Option<ElementType> {
    let TypeInner::Array { base, .. } = module.types[ty].inner else {
        return None;
    };
    match module.types[base].inner {
        TypeInner::Scalar(scalar) if scalar.width == 4 => match scalar.kind {
            ScalarKind::Float => Some(ElementType::F32),
            ScalarKind::Sint => Some(ElementType::I32),
            ScalarKind::Uint => Some(ElementType::U32),
            _ => None,
        },
        _ => None,
    }
}
