//! Assembler-token output stream.
//!
//! Emitted code is not raw bytes but a printable, comma-separated token
//! stream the trampoline linker assembles later: decimal bytes, small JSON
//! escapes for multi-byte values and relocations, and quoted labels. This
//! writer owns all formatting so the encoders never format by hand.
//!
//! The stream writes into a fixed-capacity buffer supplied by the caller;
//! exhaustion is latched and surfaced when a fragment is sliced off.

use crate::BuildError;

pub struct TokenOut {
    buf: String,
    cap: usize,
    overflow: bool,
    mark: usize,
}

impl TokenOut {
    pub fn with_capacity(cap: usize) -> TokenOut {
        TokenOut {
            buf: String::new(),
            cap,
            overflow: false,
            mark: 0,
        }
    }

    fn put(&mut self, s: &str) {
        if self.overflow || self.buf.len() + s.len() > self.cap {
            self.overflow = true;
            return;
        }
        self.buf.push_str(s);
    }

    /// One literal machine-code byte.
    pub fn byte(&mut self, b: u8) {
        self.put(&format!("{b},"));
    }

    pub fn bytes(&mut self, bs: &[u8]) {
        for &b in bs {
            self.byte(b);
        }
    }

    pub fn int8(&mut self, v: i64) {
        self.put(&format!("{{\"int8\":{v}}},"));
    }

    pub fn int16(&mut self, v: i64) {
        self.put(&format!("{{\"int16\":{v}}},"));
    }

    pub fn int32(&mut self, v: i64) {
        self.put(&format!("{{\"int32\":{v}}},"));
    }

    pub fn int64(&mut self, v: i64) {
        self.put(&format!("{{\"int64\":{v}}},"));
    }

    /// 8-bit PC-relative displacement to a label.
    pub fn rel8_label(&mut self, label: &str) {
        self.put(&format!("{{\"rel8\":\"{label}\"}},"));
    }

    /// 32-bit PC-relative displacement to a label.
    pub fn rel32_label(&mut self, label: &str) {
        self.put(&format!("{{\"rel32\":\"{label}\"}},"));
    }

    /// 32-bit PC-relative displacement to an absolute target.
    pub fn rel32_abs(&mut self, target: i64) {
        self.put(&format!("{{\"rel32\":{target}}},"));
    }

    /// Like [`rel32_abs`](Self::rel32_abs) but without the trailing comma;
    /// used when the relocation is the whole fragment.
    pub fn rel32_bare(&mut self, target: i64) {
        self.put(&format!("{{\"rel32\":{target}}}"));
    }

    /// A lone `int32` token with no trailing comma; used when the value is
    /// the whole fragment.
    pub fn int32_bare(&mut self, v: i64) {
        self.put(&format!("{{\"int32\":{v}}}"));
    }

    /// Define a label at the current position.
    pub fn label(&mut self, name: &str) {
        self.put(&format!("\"{name}\","));
    }

    /// Raw text blob token.
    pub fn string(&mut self, s: &str) {
        let mut tok = String::from("{\"string\":\"");
        escape_into(&mut tok, s);
        tok.push_str("\"},");
        self.put(&tok);
    }

    /// A bare quoted string, no trailing comma. `PRINT` fragments are one
    /// of these and nothing else.
    pub fn quoted(&mut self, s: &str, newline: bool) {
        let mut tok = String::from("\"");
        escape_into(&mut tok, s);
        if newline {
            tok.push_str("\\n");
        }
        tok.push('"');
        self.put(&tok);
    }

    /// Slice off everything emitted since the previous fragment boundary.
    /// Buffer exhaustion anywhere in the fragment surfaces here.
    pub fn take_fragment(&mut self) -> Result<String, BuildError> {
        if self.overflow {
            return Err(BuildError::Stream { cap: self.cap });
        }
        let frag = self.buf[self.mark..].to_string();
        self.mark = self.buf.len();
        Ok(frag)
    }
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000c}' => out.push_str("\\f"),
            c => out.push(c),
        }
    }
}
