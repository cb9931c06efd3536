//! Kernel libraries shipped with the crate.
//!
//! Every kernel here bounds-checks its global index against the result's
//! element count, so partially filled last groups never write past the end.

pub mod add_op;
pub mod wgsl;

#[cfg(feature = "cpu")]
pub use cpu::{builtin_cpu_kernels, CpuKernel, CpuKernelFn, Invocation};

#[cfg(feature = "cpu")]
mod cpu {
    use super::add_op;
    use crate::layout::{BindingDecl, BINDING_COUNT, SLOT_INPUT_A, SLOT_INPUT_B, SLOT_RESULT};
    use crate::{Element, ElementType};

    /// Entry point of a kernel executed by [`CpuDevice`](crate::CpuDevice),
    /// called once per thread.
    pub type CpuKernelFn = fn(&mut Invocation<'_>);

    /// A kernel for the CPU device: a name, the bindings it declares and its body.
    ///
    /// A declared binding with `element: None` takes the element type the
    /// program is loaded for.
    #[derive(Clone)]
    pub struct CpuKernel {
        pub name: String,
        pub bindings: [BindingDecl; BINDING_COUNT],
        pub func: CpuKernelFn,
    }

    impl CpuKernel {
        pub fn new(
            name: impl Into<String>,
            bindings: [BindingDecl; BINDING_COUNT],
            func: CpuKernelFn,
        ) -> Self {
            Self {
                name: name.into(),
                bindings,
                func,
            }
        }

        #[must_use]
        pub fn declared_bindings(&self, element: ElementType) -> Vec<BindingDecl> {
            self.bindings
                .iter()
                .map(|decl| BindingDecl {
                    element: decl.element.or(Some(element)),
                    ..*decl
                })
                .collect()
        }
    }

    impl std::fmt::Debug for CpuKernel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("CpuKernel")
                .field("name", &self.name)
                .field("bindings", &self.bindings)
                .finish_non_exhaustive()
        }
    }

    /// One thread of a CPU dispatch.
    ///
    /// Buffers are raw device storage and may extend past `element_count`
    /// (guard padding), so nothing stops a kernel from writing out of bounds
    /// except its own check.
    pub struct Invocation<'a> {
        pub global_id: usize,
        pub element_count: usize,
        element: ElementType,
        input_a: &'a [u8],
        input_b: &'a [u8],
        result: &'a mut [u8],
    }

    impl<'a> Invocation<'a> {
        pub(crate) fn new(
            element: ElementType,
            element_count: usize,
            input_a: &'a [u8],
            input_b: &'a [u8],
            result: &'a mut [u8],
        ) -> Self {
            Self {
                global_id: 0,
                element_count,
                element,
                input_a,
                input_b,
                result,
            }
        }

        #[must_use]
        pub fn element_type(&self) -> ElementType {
            self.element
        }

        /// Reads element `index` of the buffer bound at `slot`.
        ///
        /// # Panics
        ///
        /// If `index` lies outside the storage; the CPU device reports that as a
        /// lost device.
        #[must_use]
        pub fn load<T: Element>(&self, slot: u32, index: usize) -> T {
            let bytes: &[u8] = match slot {
                SLOT_INPUT_A => self.input_a,
                SLOT_INPUT_B => self.input_b,
                SLOT_RESULT => self.result,
                _ => panic!("no buffer bound at slot {slot}"),
            };
            let size = std::mem::size_of::<T>();
            bytemuck::pod_read_unaligned(&bytes[index * size..(index + 1) * size])
        }

        /// Writes element `index` of the result buffer.
        ///
        /// # Panics
        ///
        /// If `index` lies outside the storage.
        pub fn store<T: Element>(&mut self, index: usize, value: T) {
            let size = std::mem::size_of::<T>();
            self.result[index * size..(index + 1) * size]
                .copy_from_slice(bytemuck::bytes_of(&value));
        }
    }

    #[must_use]
    pub fn builtin_cpu_kernels() -> Vec<CpuKernel> {
        vec![add_op::cpu_kernel()]
    }
}
