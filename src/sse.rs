use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt as _;

use crate::{GatewayError, Result};

/// Upper bound on a single SSE line; anything larger is a broken upstream.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Reads one `\n`-terminated line into `out` without buffering more than
/// `MAX_LINE_BYTES`. Returns false on a clean EOF with nothing read.
async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline = buf.iter().position(|byte| *byte == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take) > MAX_LINE_BYTES {
            return Err(GatewayError::InvalidResponse(format!(
                "SSE line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        out.extend_from_slice(&buf[..take]);
        reader.consume(take);

        if newline.is_some() {
            return Ok(true);
        }
    }
}

/// Next `data:` payload from an SSE body. Lines without the `data:` prefix
/// are skipped; `[DONE]` and EOF both end the stream with `None`.
pub async fn next_data_payload<R>(reader: &mut R, scratch: &mut Vec<u8>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        if !read_line_limited(reader, scratch).await? {
            return Ok(None);
        }

        let line = match std::str::from_utf8(scratch) {
            Ok(line) => line.trim_end_matches(['\r', '\n']),
            Err(_) => continue,
        };

        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim_start();
        if payload.is_empty() {
            continue;
        }
        if payload == "[DONE]" {
            return Ok(None);
        }
        return Ok(Some(payload.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect(input: &str) -> Result<Vec<String>> {
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        let mut scratch = Vec::new();
        let mut out = Vec::new();
        while let Some(payload) = next_data_payload(&mut reader, &mut scratch).await? {
            out.push(payload);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn yields_data_payloads_and_stops_at_done() -> Result<()> {
        let input = concat!(
            "event: message\n",
            ": keepalive comment\n",
            "data: {\"a\":1}\n",
            "\n",
            "data: {\"b\":2}\r\n",
            "data: [DONE]\n",
            "data: {\"after\":true}\n",
        );
        let payloads = collect(input).await?;
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
        Ok(())
    }

    #[tokio::test]
    async fn eof_without_done_ends_the_stream() -> Result<()> {
        let payloads = collect("data: {\"a\":1}\n").await?;
        assert_eq!(payloads, vec!["{\"a\":1}"]);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_lines_error_out() {
        let input = format!("data: {}\n", "x".repeat(MAX_LINE_BYTES + 1));
        let err = collect(&input).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }
}
