//! COPY FROM STDIN encoders.
//!
//! The binary format is used when every column's type has a binary form and
//! the values were coerced to it first. Otherwise the text format is used and
//! the server parses each field into whatever type the table declares.

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use tokio_postgres::Transaction;

use crate::core::inference::render_text;
use crate::core::SqlValue;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Builds a `FORMAT BINARY` COPY payload.
pub struct BinaryCopyEncoder {
    buf: BytesMut,
}

impl BinaryCopyEncoder {
    pub fn with_capacity(rows: usize) -> Self {
        let mut buf = BytesMut::with_capacity(19 + rows * 64);
        // PGCOPY header: signature + flags + extension
        buf.put_slice(b"PGCOPY\n\xff\r\n\0");
        buf.put_i32(0);
        buf.put_i32(0);
        Self { buf }
    }

    /// Append one tuple. Values must already be coerced to the column types.
    pub fn write_row(&mut self, row: &[SqlValue]) {
        self.buf.put_i16(row.len() as i16);
        for value in row {
            write_binary_value(&mut self.buf, value);
        }
    }

    pub fn finish(mut self) -> Bytes {
        self.buf.put_i16(-1);
        self.buf.freeze()
    }
}

/// Write a single field in PostgreSQL binary format.
fn write_binary_value(buf: &mut BytesMut, value: &SqlValue) {
    match value {
        SqlValue::Null => buf.put_i32(-1),
        SqlValue::Bool(b) => {
            buf.put_i32(1);
            buf.put_u8(u8::from(*b));
        }
        SqlValue::Int(i) => {
            buf.put_i32(8);
            buf.put_i64(*i);
        }
        SqlValue::Float(f) => {
            buf.put_i32(8);
            buf.put_f64(*f);
        }
        SqlValue::Text(s) => {
            buf.put_i32(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        SqlValue::Timestamp(ts) => {
            // microseconds since 2000-01-01
            let micros = ts.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000;
            buf.put_i32(8);
            buf.put_i64(micros);
        }
    }
}

/// Builds a `FORMAT TEXT` COPY payload.
pub struct TextCopyEncoder {
    buf: String,
}

impl TextCopyEncoder {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            buf: String::with_capacity(rows * 64),
        }
    }

    pub fn write_row(&mut self, row: &[SqlValue]) {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                self.buf.push('\t');
            }
            self.buf.push_str(&value_to_text(value));
        }
        self.buf.push('\n');
    }

    pub fn finish(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// Convert a value to its COPY text field.
fn value_to_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "\\N".to_string(),
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::Float(f) if f.is_nan() => "NaN".to_string(),
        SqlValue::Float(f) if f.is_infinite() => {
            if f.is_sign_positive() { "Infinity" } else { "-Infinity" }.to_string()
        }
        SqlValue::Text(s) => escape_copy_text(s),
        other => render_text(other),
    }
}

/// Escape text for PostgreSQL COPY.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

/// Stream a prepared payload through `COPY ... FROM STDIN`.
///
/// Returns the row count reported by the server.
pub async fn copy_in(
    tx: &Transaction<'_>,
    copy_sql: &str,
    payload: Bytes,
) -> std::result::Result<u64, tokio_postgres::Error> {
    let sink = tx.copy_in(copy_sql).await?;
    tokio::pin!(sink);
    sink.send(payload).await?;
    sink.finish().await
}
