//! Element-wise addition: `result[i] = input_a[i] + input_b[i]`.

use crate::ElementType;

pub const NAME: &str = "add";

/// WGSL for `element`, specialized for `group_size` threads per group.
///
/// The bounds check uses `arrayLength(&buffer_result)` as N, so the result
/// binding must hold exactly N elements. The GPU device allocates regions at
/// their exact byte size for N > 0, and empty dispatches are never submitted.
#[must_use]
pub fn wgsl_source(element: ElementType, group_size: u32) -> String {
    let t = element.wgsl_name();
    format!(
        r"
@group(0) @binding(0) var<storage, read> buffer_a: array<{t}>;
@group(0) @binding(1) var<storage, read> buffer_b: array<{t}>;
@group(0) @binding(2) var<storage, read_write> buffer_result: array<{t}>;

@compute @workgroup_size({group_size})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let index = gid.x;
    if (index >= arrayLength(&buffer_result)) {{
        return;
    }}
    buffer_result[index] = buffer_a[index] + buffer_b[index];
}}
"
    )
}

#[cfg(feature = "cpu")]
pub use cpu::cpu_kernel;

#[cfg(feature = "cpu")]
mod cpu {
    use super::NAME;
    use crate::kernels::{CpuKernel, Invocation};
    use crate::layout::{self, BindingDecl, SLOT_INPUT_A, SLOT_INPUT_B};
    use crate::{Element, ElementType};

    #[must_use]
    pub fn cpu_kernel() -> CpuKernel {
        let bindings =
            layout::contract(ElementType::F32).map(|decl| BindingDecl { element: None, ..decl });
        CpuKernel::new(NAME, bindings, add)
    }

    fn add(invocation: &mut Invocation<'_>) {
        match invocation.element_type() {
            ElementType::F32 => add_typed::<f32>(invocation),
            ElementType::I32 => add_typed::<i32>(invocation),
            ElementType::U32 => add_typed::<u32>(invocation),
        }
    }

    fn add_typed<T: Element>(invocation: &mut Invocation<'_>) {
        let index = invocation.global_id;
        if index >= invocation.element_count {
            return;
        }
        let a: T = invocation.load(SLOT_INPUT_A, index);
        let b: T = invocation.load(SLOT_INPUT_B, index);
        invocation.store(index, Element::add(a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_is_specialized() {
        let source = wgsl_source(ElementType::U32, 64);
        assert!(source.contains("@workgroup_size(64)"));
        assert!(source.contains("array<u32>"));
        assert!(!source.contains("f32"));
    }

    #[test]
    fn bounds_check_reads_the_result_length() {
        let source = wgsl_source(ElementType::F32, 256);
        assert!(source.contains("if (index >= arrayLength(&buffer_result))"));
    }

    #[cfg(feature = "cpu")]
    #[test]
    fn cpu_kernel_skips_threads_past_the_end() {
        use crate::kernels::Invocation;

        let a: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec();
        let b: Vec<u8> = bytemuck::cast_slice(&[10.0f32, 20.0]).to_vec();
        let mut out = vec![0xffu8; 12];
        let kernel = cpu_kernel();
        let mut invocation = Invocation::new(ElementType::F32, 2, &a, &b, &mut out);
        for gid in 0..3 {
            invocation.global_id = gid;
            (kernel.func)(&mut invocation);
        }
        assert_eq!(&out[8..], &[0xff; 4]);
        let sums: Vec<f32> =
            out[..8].chunks_exact(4).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(sums, vec![11.0, 22.0]);
    }
}
