use netforge_core::{CompositionError, NetworkDefinition, TensorHandle};
use tracing::trace;

use crate::module::{Module, ModuleDescriptor, ModuleKind};

/// An ordered, non-empty chain of modules applied left to right.
///
/// Every adjacent pair is checked when the chain is built, so a `Sequential`
/// that exists is always compatible end to end.
#[derive(Debug)]
pub struct Sequential {
    descriptor: ModuleDescriptor,
    members: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(members: Vec<Box<dyn Module>>) -> Result<Self, CompositionError> {
        check_chain(&members)?;
        Ok(Self::assemble(members))
    }

    pub fn builder() -> SequentialBuilder {
        SequentialBuilder::default()
    }

    /// For generators whose output is compatible by construction.
    pub(crate) fn new_unchecked(members: Vec<Box<dyn Module>>) -> Self {
        debug_assert!(check_chain(&members).is_ok());
        Self::assemble(members)
    }

    fn assemble(members: Vec<Box<dyn Module>>) -> Self {
        let first = members[0].descriptor();
        let last = members[members.len() - 1].descriptor();
        let descriptor = ModuleDescriptor {
            in_shape: first.in_shape.clone(),
            out_shape: last.out_shape.clone(),
            batch_size: first.batch_size,
        };
        Self {
            descriptor,
            members,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Leaf modules in evaluation order, nested chains expanded.
    pub fn flatten(&self) -> Vec<&dyn Module> {
        let mut out = Vec::new();
        flatten_into(&self.members, &mut out);
        out
    }
}

fn flatten_into<'a>(members: &'a [Box<dyn Module>], out: &mut Vec<&'a dyn Module>) {
    for member in members {
        let nested = member.members();
        if nested.is_empty() {
            out.push(member.as_ref());
        } else {
            flatten_into(nested, out);
        }
    }
}

fn check_chain(members: &[Box<dyn Module>]) -> Result<(), CompositionError> {
    if members.is_empty() {
        return Err(CompositionError::EmptyChain);
    }
    for (index, pair) in members.windows(2).enumerate() {
        pair[1]
            .descriptor()
            .check_follows(pair[0].descriptor(), index + 1)?;
    }
    Ok(())
}

impl Module for Sequential {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Sequential {
            len: self.members.len(),
        }
    }

    fn apply(&self, network: &mut dyn NetworkDefinition, input: TensorHandle) -> TensorHandle {
        self.members
            .iter()
            .enumerate()
            .fold(input, |tensor, (index, member)| {
                let out = member.apply(network, tensor);
                trace!(index, module = %member.kind(), input = tensor.0, output = out.0, "applied");
                out
            })
    }

    fn parameter_count(&self) -> usize {
        self.members.iter().map(|m| m.parameter_count()).sum()
    }

    fn members(&self) -> &[Box<dyn Module>] {
        &self.members
    }
}

#[derive(Debug, Default)]
pub struct SequentialBuilder {
    members: Vec<Box<dyn Module>>,
}

impl SequentialBuilder {
    pub fn then(mut self, module: impl Module + 'static) -> Self {
        self.members.push(Box::new(module));
        self
    }

    pub fn build(self) -> Result<Sequential, CompositionError> {
        Sequential::new(self.members)
    }
}

/// `sequential![a, b, c]` boxes each module and builds a checked
/// [`Sequential`].
#[macro_export]
macro_rules! sequential {
    ($($module:expr),+ $(,)?) => {
        $crate::Sequential::new(vec![
            $(::std::boxed::Box::new($module) as ::std::boxed::Box<dyn $crate::Module>),+
        ])
    };
}
