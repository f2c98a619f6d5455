// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ticket encoder: turns a parking ticket into an ESC/POS byte stream.
//
// Encoding is a pure function of (ticket, capabilities, settings). The same
// inputs always produce the same bytes, which is what lets a retried job
// reprint exactly what the first attempt tried to print.

use sha2::{Digest, Sha256};

use ticketpress_core::error::EncodingError;
use ticketpress_core::types::{Capabilities, Feature, PrintSettings, Ticket};

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;

/// Narrowest and widest line widths we know how to lay out.
const MIN_LINE_WIDTH: usize = 16;
const MAX_LINE_WIDTH: usize = 64;

/// Continuation lines allowed for one field before it gets truncated.
const MAX_FIELD_LINES: usize = 4;

/// Largest QR payload we store in the printer's symbol buffer.
const MAX_QR_PAYLOAD: usize = 512;

const TIME_FORMAT: &str = "%d/%m/%Y %H:%M";

/// Encoded printer bytes for one ticket. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTicket {
    bytes: Vec<u8>,
    digest: String,
}

impl EncodedTicket {
    fn new(bytes: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&bytes));
        Self { bytes, digest }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// SHA-256 of the bytes, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Encode a ticket with the default print settings.
pub fn encode(ticket: &Ticket, caps: &Capabilities) -> Result<EncodedTicket, EncodingError> {
    TicketEncoder::new(caps, &PrintSettings::default()).encode(ticket)
}

/// Text alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

/// ESC/POS command builder that refuses features the printer did not declare.
pub struct EscPosBuilder<'a> {
    buf: Vec<u8>,
    caps: &'a Capabilities,
}

impl<'a> EscPosBuilder<'a> {
    /// Start a stream with the initialize command (ESC @).
    pub fn new(caps: &'a Capabilities) -> Self {
        let mut buf = Vec::with_capacity(1024);
        buf.extend_from_slice(&[ESC, b'@']);
        Self { buf, caps }
    }

    pub fn width(&self) -> usize {
        self.caps.line_width
    }

    fn require(&self, feature: Feature) -> Result<(), EncodingError> {
        if self.caps.supports(feature) {
            Ok(())
        } else {
            Err(EncodingError::UnsupportedFeature {
                feature,
                command_set: self.caps.command_set,
            })
        }
    }

    /// Write text, replacing anything outside printable ASCII.
    pub fn text(&mut self, s: &str) -> &mut Self {
        self.buf.extend(sanitize(s).bytes());
        self
    }

    pub fn line(&mut self, s: &str) -> &mut Self {
        self.text(s);
        self.buf.push(b'\n');
        self
    }

    pub fn newline(&mut self) -> &mut Self {
        self.buf.push(b'\n');
        self
    }

    /// ESC d n — print and feed n lines.
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, b'd', lines]);
        self
    }

    /// ESC a n
    pub fn align(&mut self, align: Align) -> Result<&mut Self, EncodingError> {
        self.require(Feature::Alignment)?;
        let n = match align {
            Align::Left => 0,
            Align::Center => 1,
            Align::Right => 2,
        };
        self.buf.extend_from_slice(&[ESC, b'a', n]);
        Ok(self)
    }

    /// ESC E n
    pub fn bold(&mut self, on: bool) -> Result<&mut Self, EncodingError> {
        self.require(Feature::Bold)?;
        self.buf.extend_from_slice(&[ESC, b'E', u8::from(on)]);
        Ok(self)
    }

    /// ESC - n
    pub fn underline(&mut self, on: bool) -> Result<&mut Self, EncodingError> {
        self.require(Feature::Underline)?;
        self.buf.extend_from_slice(&[ESC, b'-', u8::from(on)]);
        Ok(self)
    }

    /// GS ! n — character width/height multipliers (1..=8).
    pub fn scale(&mut self, width: u8, height: u8) -> Result<&mut Self, EncodingError> {
        self.require(Feature::FontScale)?;
        let w = width.clamp(1, 8) - 1;
        let h = height.clamp(1, 8) - 1;
        self.buf.extend_from_slice(&[GS, b'!', (w << 4) | h]);
        Ok(self)
    }

    /// GS V 66 n — feed n lines, then full cut.
    pub fn cut_feed(&mut self, lines: u8) -> Result<&mut Self, EncodingError> {
        self.require(Feature::Cut)?;
        self.buf.extend_from_slice(&[GS, b'V', 66, lines]);
        Ok(self)
    }

    /// GS ( k — QR model 2, module size 6, error correction M.
    pub fn qr(&mut self, data: &str) -> Result<&mut Self, EncodingError> {
        self.require(Feature::QrCode)?;
        let data = sanitize(data);
        if data.len() > MAX_QR_PAYLOAD {
            return Err(EncodingError::OversizedField {
                field: "qr_payload",
                len: data.len(),
                max: MAX_QR_PAYLOAD,
            });
        }
        // Model 2
        self.buf
            .extend_from_slice(&[GS, b'(', b'k', 4, 0, 49, 65, 50, 0]);
        // Module size
        self.buf.extend_from_slice(&[GS, b'(', b'k', 3, 0, 49, 67, 6]);
        // Error correction level M
        self.buf.extend_from_slice(&[GS, b'(', b'k', 3, 0, 49, 69, 49]);
        // Store symbol data
        let len = data.len() + 3;
        self.buf
            .extend_from_slice(&[GS, b'(', b'k', (len & 0xFF) as u8, (len >> 8) as u8, 49, 80, 48]);
        self.buf.extend_from_slice(data.as_bytes());
        // Print symbol
        self.buf.extend_from_slice(&[GS, b'(', b'k', 3, 0, 49, 81, 48]);
        self.buf.push(b'\n');
        Ok(self)
    }

    /// A full-width line of `ch`.
    pub fn separator(&mut self, ch: char) -> &mut Self {
        let line: String = std::iter::repeat_n(ch, self.width()).collect();
        self.line(&line)
    }

    /// `Label: value`, wrapping the value under itself.
    pub fn field(&mut self, label: &str, value: &str) -> &mut Self {
        let width = self.width();
        let prefix = truncate(&format!("{label}: "), width / 2);
        let indent = " ".repeat(prefix.len());
        let lines = wrap_limited(value, width - prefix.len(), MAX_FIELD_LINES);
        for (i, line) in lines.iter().enumerate() {
            if i == 0 {
                self.text(&prefix);
            } else {
                self.text(&indent);
            }
            self.line(line);
        }
        self
    }

    /// Centre-wrapped paragraph (caller sets alignment).
    pub fn paragraph(&mut self, text: &str) -> &mut Self {
        let width = self.width();
        for line in wrap_limited(text, width, MAX_FIELD_LINES) {
            self.line(&line);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// Lays a parking ticket out on an [`EscPosBuilder`].
pub struct TicketEncoder<'a> {
    caps: &'a Capabilities,
    settings: &'a PrintSettings,
}

impl<'a> TicketEncoder<'a> {
    pub fn new(caps: &'a Capabilities, settings: &'a PrintSettings) -> Self {
        Self { caps, settings }
    }

    pub fn encode(&self, ticket: &Ticket) -> Result<EncodedTicket, EncodingError> {
        let width = self.caps.line_width;
        if !(MIN_LINE_WIDTH..=MAX_LINE_WIDTH).contains(&width) {
            return Err(EncodingError::InvalidCapabilities(format!(
                "line width {width} outside {MIN_LINE_WIDTH}..={MAX_LINE_WIDTH}"
            )));
        }

        // The ticket number is printed at double width and is never wrapped.
        let number = sanitize(ticket.ticket_number.trim());
        if number.len() > width / 2 {
            return Err(EncodingError::OversizedField {
                field: "ticket_number",
                len: number.len(),
                max: width / 2,
            });
        }

        let want_qr = self.settings.print_qr && ticket.qr_payload.is_some();
        if want_qr && !self.caps.supports(Feature::QrCode) {
            return Err(EncodingError::UnsupportedFeature {
                feature: Feature::QrCode,
                command_set: self.caps.command_set,
            });
        }
        if self.settings.cut_paper && !self.caps.supports(Feature::Cut) {
            return Err(EncodingError::UnsupportedFeature {
                feature: Feature::Cut,
                command_set: self.caps.command_set,
            });
        }

        let mut b = EscPosBuilder::new(self.caps);

        // Header
        b.align(Align::Center)?;
        b.bold(true)?;
        b.paragraph(&ticket.business_name);
        b.bold(false)?;
        if let Some(address) = &ticket.business_address {
            b.paragraph(address);
        }
        if let Some(phone) = &ticket.business_phone {
            b.line(&truncate(&format!("Tel: {phone}"), width));
        }
        b.separator('=');

        // Ticket number block
        if self.caps.supports(Feature::Underline) {
            b.underline(true)?;
            b.line("PARKING TICKET");
            b.underline(false)?;
        } else {
            b.line("PARKING TICKET");
        }
        b.scale(2, 2)?;
        b.bold(true)?;
        b.line(&number);
        b.bold(false)?;
        b.scale(1, 1)?;
        b.line(&format!("Serial #{:06}", ticket.serial));
        b.separator('-');

        // Field rows
        b.align(Align::Left)?;
        let vehicle = &ticket.vehicle;
        b.field("Vehicle No", &vehicle.number);
        b.field("Type", &vehicle.kind);
        b.field("Transport", &vehicle.transport_name);
        if let Some(driver) = &vehicle.driver_name {
            b.field("Driver", driver);
        }
        if let Some(phone) = &vehicle.driver_phone {
            b.field("Phone", phone);
        }
        b.field("Entry", &ticket.entry_time.format(TIME_FORMAT).to_string());
        if let Some(exit) = &ticket.exit_time {
            b.field("Exit", &exit.format(TIME_FORMAT).to_string());
        }
        if let Some(fee) = &ticket.fee {
            b.bold(true)?;
            b.field("Fee", &fee.display());
            b.bold(false)?;
        }
        match (&ticket.payment_status, &ticket.payment_type) {
            (Some(status), Some(kind)) => {
                b.field("Payment", &format!("{status} ({kind})"));
            }
            (Some(status), None) => {
                b.field("Payment", status);
            }
            (None, Some(kind)) => {
                b.field("Payment", kind);
            }
            (None, None) => {}
        }
        if let Some(notes) = &ticket.notes {
            b.field("Notes", notes);
        }
        if let Some(operator) = &ticket.issued_by {
            b.field("Issued by", operator);
        }
        b.separator('-');

        // QR block
        if let Some(payload) = ticket.qr_payload.as_deref().filter(|_| want_qr) {
            b.align(Align::Center)?;
            b.qr(payload)?;
            b.align(Align::Left)?;
        }

        // Signature line
        b.newline();
        let label = "Signature: ";
        b.text(label);
        b.line(&"_".repeat(width.saturating_sub(label.len())));

        if let Some(footer) = &self.settings.footer {
            b.newline();
            b.align(Align::Center)?;
            b.paragraph(footer);
        }

        if self.settings.cut_paper {
            b.cut_feed(self.settings.feed_lines)?;
        } else {
            b.feed(self.settings.feed_lines);
        }

        Ok(EncodedTicket::new(b.build()))
    }
}

/// Keep printable ASCII; whitespace becomes a space, anything else `?`.
///
/// Control bytes never reach the printer from ticket text.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else if c.is_whitespace() {
                ' '
            } else {
                '?'
            }
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    let s = sanitize(s);
    if s.len() <= max {
        s
    } else if max <= 3 {
        s[..max].to_string()
    } else {
        format!("{}...", &s[..max - 3])
    }
}

/// Greedy word wrap; words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let text = sanitize(text);
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split(' ').filter(|w| !w.is_empty()) {
        let mut word = word;
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word[..width].to_string());
            word = &word[width..];
        }
        if word.is_empty() {
            continue;
        }
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::replace(&mut current, word.to_string()));
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Wrap, keeping at most `max_lines`; the last kept line ends in `...` when
/// something was cut off.
fn wrap_limited(text: &str, width: usize, max_lines: usize) -> Vec<String> {
    let mut lines = wrap(text, width);
    if lines.len() > max_lines {
        lines.truncate(max_lines);
        if let Some(last) = lines.last_mut() {
            let keep = width.saturating_sub(3).min(last.len());
            last.truncate(keep);
            last.push_str("...");
        }
    }
    lines
}
