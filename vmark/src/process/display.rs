//! Dedicated terminal rows for concurrently running processes.
//!
//! Each running process that reports progress gets its own row so several
//! encoders can redraw their status without interleaving. Purely cosmetic:
//! write errors are ignored and nothing here affects scheduling.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use crossterm::{
    cursor::{MoveRight, MoveTo, RestorePosition, SavePosition},
    queue,
    style::Print,
    terminal::{Clear, ClearType},
};
use parking_lot::Mutex;
use tracing::trace;

/// Width every rendered row is padded to.
pub const LINE_WIDTH: usize = 120;

struct Inner {
    rows: HashMap<String, u16>,
    free: BTreeSet<u16>,
    next_row: u16,
    out: Box<dyn Write + Send>,
}

impl Inner {
    fn allocate(&mut self, id: &str) -> u16 {
        if let Some(row) = self.rows.get(id) {
            return *row;
        }
        let row = match self.free.pop_first() {
            Some(row) => row,
            None => {
                let row = self.next_row;
                self.next_row = self.next_row.saturating_add(1);
                row
            }
        };
        self.rows.insert(id.to_string(), row);
        row
    }
}

/// Row allocator and renderer shared by all supervised processes.
///
/// Cloning is cheap; clones share the same row table and output.
#[derive(Clone)]
pub struct ProgressDisplay {
    inner: Option<Arc<Mutex<Inner>>>,
}

impl std::fmt::Debug for ProgressDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressDisplay")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ProgressDisplay {
    /// Render on the process's stdout.
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(Inner {
                rows: HashMap::new(),
                free: BTreeSet::new(),
                next_row: 0,
                out,
            }))),
        }
    }

    /// A display that ignores every call.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Row assigned to `id`, allocating the lowest free row on first use.
    pub fn allocate_line(&self, id: &str) -> Option<u16> {
        let inner = self.inner.as_ref()?;
        Some(inner.lock().allocate(id))
    }

    /// Redraw the row of `id` with `text`, leaving the cursor where it was.
    pub fn write(&self, id: &str, text: &str) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let mut inner = inner.lock();
        let row = inner.allocate(id);
        let rendered = format!("{:<width$}", format!("[{id}] {text}"), width = LINE_WIDTH);
        let result = queue!(
            inner.out,
            SavePosition,
            MoveTo(0, row),
            Clear(ClearType::CurrentLine),
            Print(rendered),
            RestorePosition
        )
        .and_then(|_| inner.out.flush());
        if let Err(e) = result {
            trace!(id, error = %e, "Progress display write failed");
        }
    }

    /// Release the row of `id`, keeping its last content on screen.
    pub fn free_line(&self, id: &str) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let mut inner = inner.lock();
        let Some(row) = inner.rows.remove(id) else {
            return;
        };
        inner.free.insert(row);
        let result = queue!(inner.out, MoveTo(0, row), MoveRight(999), Print("\n"))
            .and_then(|_| inner.out.flush());
        if let Err(e) = result {
            trace!(id, error = %e, "Progress display release failed");
        }
    }

    /// Allocate a row for `id` that is released when the guard drops.
    pub fn line(&self, id: impl Into<String>) -> DisplayLine {
        let id = id.into();
        self.allocate_line(&id);
        DisplayLine {
            display: self.clone(),
            id,
        }
    }
}

/// RAII handle to one display row.
#[derive(Debug)]
pub struct DisplayLine {
    display: ProgressDisplay,
    id: String,
}

impl DisplayLine {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn write(&self, text: &str) {
        self.display.write(&self.id, text);
    }
}

impl Drop for DisplayLine {
    fn drop(&mut self) {
        self.display.free_line(&self.id);
    }
}

/// In-memory writer whose contents stay readable after being handed to a display.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_idempotent_and_reuses_rows() {
        let display = ProgressDisplay::with_writer(Box::new(SharedBuffer::new()));
        assert_eq!(display.allocate_line("a"), Some(0));
        assert_eq!(display.allocate_line("b"), Some(1));
        assert_eq!(display.allocate_line("a"), Some(0));

        display.free_line("a");
        assert_eq!(display.allocate_line("c"), Some(0));
        assert_eq!(display.allocate_line("d"), Some(2));
    }

    #[test]
    fn test_write_renders_padded_text() {
        let buffer = SharedBuffer::new();
        let display = ProgressDisplay::with_writer(Box::new(buffer.clone()));
        display.write("job", "50%");

        let out = buffer.contents();
        let expected = format!("{:<120}", "[job] 50%");
        assert!(out.contains(&expected));
        // first row, cleared before drawing
        let move_to = out.find("\x1b[1;1H").unwrap();
        let clear = out.find("\x1b[2K").unwrap();
        assert!(move_to < clear);
        assert!(clear < out.find("[job]").unwrap());
    }

    #[test]
    fn test_guard_frees_row() {
        let display = ProgressDisplay::with_writer(Box::new(SharedBuffer::new()));
        {
            let line = display.line("first");
            line.write("running");
            assert_eq!(display.allocate_line("second"), Some(1));
        }
        assert_eq!(display.allocate_line("third"), Some(0));
    }

    #[test]
    fn test_disabled_ignores_calls() {
        let display = ProgressDisplay::disabled();
        assert_eq!(display.allocate_line("a"), None);
        display.write("a", "text");
        display.free_line("a");
        assert!(!display.is_enabled());
    }
}
