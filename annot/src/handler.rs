//! Handler descriptors owned by the registry.

use std::fmt;

use runtime_api::{CalleeRef, Opnd};

use crate::valgrind::VgClientRequest;

/// Callback invoked for a matched Valgrind client request; its return value
/// becomes the request result.
pub type VgCallback = Box<dyn Fn(&VgClientRequest) -> u64 + Send + Sync>;

/// Stable arena index of a handler node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u32);

pub enum HandlerKind {
    /// Reroute the annotation call site to a client callback.
    Call {
        callback: CalleeRef,
        save_fpstate: bool,
        args: Vec<Opnd>,
    },
    /// Replace the annotation function with a constant return value.
    ReturnValue { value: u64 },
    /// Valgrind client-request handler, keyed by request id rather than PC.
    Valgrind { callback: VgCallback },
}

pub struct Handler {
    pub target_pc: u64,
    pub kind: HandlerKind,
    /// Next handler registered for the same call site.
    pub next: Option<HandlerId>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            HandlerKind::Call { callback, .. } => format!("Call({})", callback.0),
            HandlerKind::ReturnValue { value } => format!("ReturnValue({value:#x})"),
            HandlerKind::Valgrind { .. } => "Valgrind".to_string(),
        };
        f.debug_struct("Handler")
            .field("target_pc", &format_args!("{:#x}", self.target_pc))
            .field("kind", &kind)
            .field("next", &self.next)
            .finish()
    }
}

/// Slab of handler nodes with stable ids; chains reference nodes by id so
/// removal never moves survivors.
#[derive(Debug, Default)]
pub(crate) struct HandlerArena {
    nodes: Vec<Option<Handler>>,
    free: Vec<u32>,
}

impl HandlerArena {
    pub fn alloc(&mut self, handler: Handler) -> HandlerId {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(handler);
            HandlerId(idx)
        } else {
            self.nodes.push(Some(handler));
            HandlerId((self.nodes.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: HandlerId) -> Option<&Handler> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Release one node, returning its chain successor.
    pub fn release(&mut self, id: HandlerId) -> Option<HandlerId> {
        let node = self.nodes.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        node.next
    }

    /// Release a whole chain starting at `head`.
    pub fn release_chain(&mut self, head: HandlerId) {
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            cursor = self.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(pc: u64, next: Option<HandlerId>) -> Handler {
        Handler {
            target_pc: pc,
            kind: HandlerKind::ReturnValue { value: 0 },
            next,
        }
    }

    #[test]
    fn ids_are_stable_across_release() {
        let mut arena = HandlerArena::default();
        let a = arena.alloc(node(0x10, None));
        let b = arena.alloc(node(0x20, None));
        arena.release(a);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).unwrap().target_pc, 0x20);
        let c = arena.alloc(node(0x30, None));
        assert_eq!(c, a); // slot reused
        assert_eq!(arena.get(b).unwrap().target_pc, 0x20);
    }

    #[test]
    fn release_chain_frees_all_links() {
        let mut arena = HandlerArena::default();
        let tail = arena.alloc(node(0x10, None));
        let head = arena.alloc(node(0x10, Some(tail)));
        arena.release_chain(head);
        assert!(arena.get(head).is_none());
        assert!(arena.get(tail).is_none());
    }
}
