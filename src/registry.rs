//! The registry of typed configuration entries.
//!
//! The host application registers each entry once at startup: a label (the
//! `KEY` in `KEY=VALUE`), a default, a trailing comment, and up to three
//! hooks. Registration order is load-bearing — it is the order lines are
//! serialized in, forever.

use core::fmt::{self, Debug};
use core::str;

pub const MAX_ENTRIES: usize = 8;
pub const MAX_LABEL_BYTES: usize = 64;
pub const MAX_COMMENT_BYTES: usize = 64;

/// Returns whether a candidate value is acceptable.
pub type ValidateFn = fn(value: &[u8]) -> bool;
/// Applies an accepted value to the application's state.
pub type UpdateFn = fn(value: &[u8]);
/// Renders the canonical `KEY=VALUE` line (no comment, no terminator) into
/// the buffer, returning the number of bytes written.
pub type PrintFn = fn(out: &mut [u8]) -> usize;

/// One registered entry.
///
/// The label and comment are owned (copied at registration); the default
/// is borrowed for the life of the program, which is what lets the value
/// callbacks hand it around without another buffer.
pub struct Entry {
    label: [u8; MAX_LABEL_BYTES],
    label_len: u8,
    comment: [u8; MAX_COMMENT_BYTES],
    comment_len: u8,
    default_value: Option<&'static str>,
    pub validate: Option<ValidateFn>,
    pub update: Option<UpdateFn>,
    pub print: Option<PrintFn>,
}

impl Entry {
    const EMPTY: Entry = Entry {
        label: [0; MAX_LABEL_BYTES],
        label_len: 0,
        comment: [0; MAX_COMMENT_BYTES],
        comment_len: 0,
        default_value: None,
        validate: None,
        update: None,
        print: None,
    };

    pub fn label(&self) -> &[u8] {
        &self.label[..self.label_len as usize]
    }

    /// The stored comment, already in its on-disk shape:
    /// `"\t<text>\r\n"`.
    pub fn comment(&self) -> &[u8] {
        &self.comment[..self.comment_len as usize]
    }

    pub fn default_value(&self) -> Option<&'static str> {
        self.default_value
    }

    /// Does `bytes` start with `label=`?
    pub fn matches_prefix(&self, bytes: &[u8]) -> bool {
        let label = self.label();
        bytes.len() > label.len() && &bytes[..label.len()] == label && bytes[label.len()] == b'='
    }
}

impl Debug for Entry {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Entry")
            .field("label", &str::from_utf8(self.label()).unwrap_or("<non-utf8>"))
            .field("default_value", &self.default_value)
            .finish()
    }
}

pub struct Registry {
    slots: [Entry; MAX_ENTRIES],
    len: usize,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            slots: [Entry::EMPTY; MAX_ENTRIES],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registers the next entry, returning false when all slots are taken.
    ///
    /// The label is clamped to 63 bytes. The comment (conventionally
    /// starting with `#`) is stored as `\t<text>\r\n` with the text
    /// clamped so the terminator always fits. There is no
    /// de-registration.
    pub fn register(
        &mut self,
        label: &str,
        default_value: Option<&'static str>,
        comment: &str,
        validate: Option<ValidateFn>,
        update: Option<UpdateFn>,
        print: Option<PrintFn>,
    ) -> bool {
        if self.len == MAX_ENTRIES {
            return false;
        }

        let slot = &mut self.slots[self.len];

        let label = label.as_bytes();
        let label_len = label.len().min(MAX_LABEL_BYTES - 1);
        slot.label[..label_len].copy_from_slice(&label[..label_len]);
        slot.label_len = label_len as u8;

        let text = comment.as_bytes();
        let text_len = text.len().min(MAX_COMMENT_BYTES - 4);
        slot.comment[0] = b'\t';
        slot.comment[1..1 + text_len].copy_from_slice(&text[..text_len]);
        slot.comment[1 + text_len] = b'\r';
        slot.comment[2 + text_len] = b'\n';
        slot.comment_len = (text_len + 3) as u8;

        slot.default_value = default_value;
        slot.validate = validate;
        slot.update = update;
        slot.print = print;

        self.len += 1;
        true
    }

    /// Occupied slots, in registration (= serialization) order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.slots[..self.len].iter()
    }

    /// Does `bytes` begin with `label=` for any registered entry?
    ///
    /// This is the cheap "is this plausibly our file?" test used both for
    /// picking a parse source and for guarding the canonical data cluster
    /// against host metadata.
    pub fn looks_like_config(&self, bytes: &[u8]) -> bool {
        self.iter().any(|entry| entry.matches_prefix(bytes))
    }
}

#[cfg(test)]
mod registry {
    use super::*;
    use assert_eq as eq;

    fn always(_: &[u8]) -> bool {
        true
    }

    #[test]
    fn registration_order_is_kept() {
        let mut reg = Registry::new();
        assert!(reg.register("SSID", Some("net"), "# network name", None, None, None));
        assert!(reg.register("PSK", Some("pw"), "# passphrase", Some(always), None, None));

        let labels: Vec<&[u8]> = reg.iter().map(|e| e.label()).collect();
        eq!(labels, vec![b"SSID".as_ref(), b"PSK".as_ref()]);
        eq!(reg.len(), 2);
    }

    #[test]
    fn fills_up_at_capacity() {
        let mut reg = Registry::new();
        for i in 0..MAX_ENTRIES {
            assert!(reg.register("K", None, "#", None, None, None), "slot {}", i);
        }
        assert!(!reg.register("LATE", None, "#", None, None, None));
        eq!(reg.len(), MAX_ENTRIES);
    }

    #[test]
    fn comment_is_wrapped_and_terminated() {
        let mut reg = Registry::new();
        reg.register("A", None, "# hi", None, None, None);

        let entry = reg.iter().next().unwrap();
        eq!(entry.comment(), b"\t# hi\r\n");
    }

    #[test]
    fn long_comment_keeps_its_terminator() {
        let long = core::str::from_utf8(&[b'x'; 100]).unwrap();
        let mut reg = Registry::new();
        reg.register("A", None, long, None, None, None);

        let comment = reg.iter().next().unwrap().comment();
        eq!(comment.len(), MAX_COMMENT_BYTES - 1);
        eq!(&comment[comment.len() - 2..], b"\r\n");
        eq!(comment[0], b'\t');
    }

    #[test]
    fn long_label_is_clamped() {
        let long = core::str::from_utf8(&[b'L'; 100]).unwrap();
        let mut reg = Registry::new();
        reg.register(long, None, "#", None, None, None);

        eq!(reg.iter().next().unwrap().label().len(), MAX_LABEL_BYTES - 1);
    }

    #[test]
    fn prefix_matching() {
        let mut reg = Registry::new();
        reg.register("SSID", None, "#", None, None, None);

        assert!(reg.looks_like_config(b"SSID=home"));
        assert!(reg.looks_like_config(b"SSID="));
        assert!(!reg.looks_like_config(b"SSIDX=home"));
        assert!(!reg.looks_like_config(b"SSID"));
        assert!(!reg.looks_like_config(b".fseventsd"));
        assert!(!reg.looks_like_config(b""));
    }
}
