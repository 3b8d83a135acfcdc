//! The `draft/typing` client capability.
//!
//! Registration only: typing notifications travel as `+draft/typing`
//! client tags on TAGMSG, which the sending engine already gates.

use crate::modules::{CapSpec, ModuleDescriptor};

pub fn descriptor() -> ModuleDescriptor {
    let mut descriptor = ModuleDescriptor::new(
        "cap_typing",
        "Provides the draft/typing client capability",
    );
    descriptor.caps.push(CapSpec {
        name: "draft/typing",
        value: None,
        gates_tags: &["+draft/typing", "+typing"],
    });
    descriptor
}
