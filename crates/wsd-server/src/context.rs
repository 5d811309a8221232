//! ContextStack — "the current connection" for one logical execution flow.
//!
//! Each connection task and each bridged request gets its own stack through
//! a tokio task-local, so nothing here is shared between flows and no
//! locking is needed. Frames are reference counted: pushing the connection
//! already on top bumps its count instead of adding a frame, and the frame
//! is only removed when the count returns to zero. Pops must mirror pushes
//! in strict LIFO order; anything else is a bug and panics.

use std::cell::RefCell;
use std::future::Future;

use wsd_protocol::{ConnectionId, DispatchError};
use wsd_transport::Connection;

tokio::task_local! {
    static CONTEXT: RefCell<ContextStack>;
}

struct Frame {
    conn: Connection,
    refs: usize,
}

/// A pop that did not match the most recent push.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextMismatch {
    #[error("popped socket context {0} from an empty stack")]
    Empty(ConnectionId),
    #[error("popped wrong socket context ({top} instead of {expected})")]
    WrongFrame {
        expected: ConnectionId,
        top: ConnectionId,
    },
}

/// Stack of reference-counted connection frames.
#[derive(Default)]
pub struct ContextStack {
    frames: Vec<Frame>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conn: Connection) {
        match self.frames.last_mut() {
            Some(top) if top.conn == conn => top.refs += 1,
            _ => self.frames.push(Frame { conn, refs: 1 }),
        }
    }

    /// Release one reference on the top frame, which must belong to `id`.
    ///
    /// # Panics
    ///
    /// If the stack is empty or the top frame is another connection's.
    pub fn pop(&mut self, id: &ConnectionId) {
        if let Err(mismatch) = self.try_pop(id) {
            panic!("{mismatch}");
        }
    }

    /// Like [`pop`](Self::pop), but reports a mismatch instead of panicking.
    /// The stack is left untouched on error.
    pub fn try_pop(&mut self, id: &ConnectionId) -> Result<(), ContextMismatch> {
        let top = self.frames.last_mut().ok_or(ContextMismatch::Empty(*id))?;
        if top.conn.id() != *id {
            return Err(ContextMismatch::WrongFrame {
                expected: *id,
                top: top.conn.id(),
            });
        }
        top.refs -= 1;
        if top.refs == 0 {
            self.frames.pop();
        }
        Ok(())
    }

    pub fn current(&self) -> Result<Connection, DispatchError> {
        self.frames
            .last()
            .map(|frame| frame.conn.clone())
            .ok_or(DispatchError::NoActiveContext)
    }

    pub fn has_context(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Number of physical frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Reference count of the top frame (0 when empty).
    pub fn top_refs(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.refs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task-local access
// ─────────────────────────────────────────────────────────────────────────────

/// Run `fut` with a fresh, empty context stack.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    CONTEXT.scope(RefCell::new(ContextStack::new()), fut).await
}

/// Run `fut` on the current task's stack, installing one if there is none.
pub async fn ensure_scope<F: Future>(fut: F) -> F::Output {
    if in_scope() { fut.await } else { scope(fut).await }
}

/// Whether a context stack is installed for the current task.
pub fn in_scope() -> bool {
    CONTEXT.try_with(|_| ()).is_ok()
}

/// The connection on top of the current task's stack.
pub fn current() -> Result<Connection, DispatchError> {
    CONTEXT
        .try_with(|stack| stack.borrow().current())
        .unwrap_or(Err(DispatchError::NoActiveContext))
}

pub fn has_context() -> bool {
    CONTEXT
        .try_with(|stack| stack.borrow().has_context())
        .unwrap_or(false)
}

/// Send `message` on the current connection.
pub fn send_to_current(message: impl Into<String>) -> Result<(), DispatchError> {
    current()?.send(message)?;
    Ok(())
}

/// Holds one reference to a frame on the current task's stack and releases
/// it on drop.
#[must_use = "the context frame is popped when the guard is dropped"]
pub struct ContextGuard {
    id: ConnectionId,
}

impl ContextGuard {
    /// Push `conn` onto the current task's stack.
    pub fn enter(conn: Connection) -> Result<Self, DispatchError> {
        let id = conn.id();
        CONTEXT
            .try_with(|stack| stack.borrow_mut().push(conn))
            .map_err(|_| DispatchError::OutsideScope)?;
        Ok(Self { id })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let result = CONTEXT.try_with(|stack| stack.borrow_mut().try_pop(&self.id));
        match result {
            Ok(Ok(())) => {}
            // Already unwinding: a second panic would abort.
            Ok(Err(mismatch)) if std::thread::panicking() => {
                tracing::error!("{mismatch}");
            }
            Ok(Err(mismatch)) => panic!("{mismatch}"),
            Err(_) => tracing::error!("Context stack gone before frame {} was popped", self.id),
        }
    }
}
