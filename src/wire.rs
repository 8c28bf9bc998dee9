//! Framed JSON messages for the admin upload protocol
//!
//! Each message is the UTF-8 JSON encoding of a value followed by a single
//! NUL byte. There is no length prefix: readers consume bytes up to and
//! including the first NUL and parse what precedes it. Binary file content
//! follows a [`FileMessage`] without any framing (exactly `size` bytes).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// First message on an upload connection: the site metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppMessage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, rename = "letsencryptmail")]
    pub lets_encrypt_mail: String,
    #[serde(default, rename = "httpsonly")]
    pub https_only: bool,
}

/// Server reply to an [`AppMessage`]: the assigned version and upload id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accept {
    pub version: u32,
    pub id: String,
}

/// One entry of the bundle. A name ending in `/` with size 0 is a directory;
/// an empty name with non-positive size terminates the list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMessage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub perm: i32,
}

impl FileMessage {
    /// The terminator entry that closes the file list.
    pub fn end() -> Self {
        Self::default()
    }

    pub fn is_end(&self) -> bool {
        self.name.is_empty() && self.size <= 0
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/') && self.size <= 0
    }
}

/// Final message of an upload: success flag and error text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "status")]
    pub ok: bool,
    #[serde(default)]
    pub msg: String,
}

/// Read one NUL-terminated JSON message.
///
/// Errors on EOF before the NUL and on malformed JSON.
pub async fn read_json0<R, T>(reader: &mut R) -> anyhow::Result<T>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut buf = Vec::new();
    let n = reader.read_until(0, &mut buf).await?;
    if n == 0 || buf.last() != Some(&0) {
        anyhow::bail!("connection closed mid-message");
    }
    buf.pop();
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one value as a NUL-terminated JSON message.
pub async fn write_json0<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(0);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Skip any run of leading NUL bytes on the stream.
///
/// SSH-tunneled uploads may push a NUL prelude through before the first real
/// message (password prompts and friends end up on the same channel).
pub async fn skip_leading_nuls<R>(reader: &mut R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            anyhow::bail!("connection closed before first message");
        }
        let zeros = buf.iter().take_while(|b| **b == 0).count();
        let done = zeros < buf.len();
        reader.consume(zeros);
        if done {
            return Ok(());
        }
    }
}

/// Blocking variant of [`read_json0`] for synchronous clients.
pub fn read_json0_blocking<R, T>(reader: &mut R) -> anyhow::Result<T>
where
    R: std::io::BufRead + ?Sized,
    T: for<'de> Deserialize<'de>,
{
    let mut buf = Vec::new();
    let n = std::io::BufRead::read_until(reader, 0, &mut buf)?;
    if n == 0 || buf.last() != Some(&0) {
        anyhow::bail!("connection closed mid-message");
    }
    buf.pop();
    Ok(serde_json::from_slice(&buf)?)
}

/// Blocking variant of [`write_json0`] for synchronous clients.
pub fn write_json0_blocking<W, T>(writer: &mut W, value: &T) -> anyhow::Result<()>
where
    W: std::io::Write + ?Sized,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(0);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn file_message_round_trip() {
        let msg = FileMessage {
            name: "assets/logo.png".to_string(),
            size: 10 * 1024 * 1024,
            perm: 0o644,
        };

        let mut buf = Vec::new();
        write_json0(&mut buf, &msg).await.unwrap();
        assert_eq!(buf.last(), Some(&0));

        let mut reader = BufReader::new(Cursor::new(buf));
        let decoded: FileMessage = read_json0(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn negative_perm_survives() {
        let msg = FileMessage {
            name: "locked".to_string(),
            size: 1,
            perm: -1,
        };
        let mut buf = Vec::new();
        write_json0(&mut buf, &msg).await.unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        let decoded: FileMessage = read_json0(&mut reader).await.unwrap();
        assert_eq!(decoded.perm, -1);
    }

    #[tokio::test]
    async fn app_message_field_names() {
        let json = br#"{"name":"blog","version":"v3","command":"node app.js ${PORT}","hosts":["example.com"],"env":["NODE_ENV=production"],"tls":true,"letsencryptmail":"ops@example.com","httpsonly":true}"#;
        let mut framed = json.to_vec();
        framed.push(0);

        let mut reader = BufReader::new(Cursor::new(framed));
        let app: AppMessage = read_json0(&mut reader).await.unwrap();
        assert_eq!(app.name, "blog");
        assert_eq!(app.hosts, vec!["example.com"]);
        assert!(app.tls);
        assert_eq!(app.lets_encrypt_mail, "ops@example.com");
        assert!(app.https_only);
    }

    #[tokio::test]
    async fn status_uses_wire_field_name() {
        let mut buf = Vec::new();
        write_json0(
            &mut buf,
            &Status {
                ok: false,
                msg: "file size too large".to_string(),
            },
        )
        .await
        .unwrap();
        let text = std::str::from_utf8(&buf[..buf.len() - 1]).unwrap();
        assert!(text.contains(r#""status":false"#));
        assert!(text.contains(r#""msg":"file size too large""#));
    }

    #[tokio::test]
    async fn missing_fields_default() {
        let mut framed = br#"{"name":"x"}"#.to_vec();
        framed.push(0);
        let mut reader = BufReader::new(Cursor::new(framed));
        let app: AppMessage = read_json0(&mut reader).await.unwrap();
        assert_eq!(app.command, "");
        assert!(!app.tls);
        assert!(app.hosts.is_empty());
    }

    #[tokio::test]
    async fn end_marker_detection() {
        assert!(FileMessage::end().is_end());
        assert!(FileMessage {
            name: String::new(),
            size: -1,
            perm: 0
        }
        .is_end());
        assert!(!FileMessage {
            name: "a".to_string(),
            size: 0,
            perm: 0
        }
        .is_end());
    }

    #[tokio::test]
    async fn directory_detection() {
        assert!(FileMessage {
            name: "static/".to_string(),
            size: 0,
            perm: 0
        }
        .is_dir());
        assert!(!FileMessage {
            name: "static".to_string(),
            size: 0,
            perm: 0
        }
        .is_dir());
    }

    #[tokio::test]
    async fn leading_nuls_are_skipped() {
        let mut data = vec![0u8, 0, 0, 0];
        let mut framed = br#"{"name":"x"}"#.to_vec();
        framed.push(0);
        data.extend_from_slice(&framed);

        let mut reader = BufReader::new(Cursor::new(data));
        skip_leading_nuls(&mut reader).await.unwrap();
        let app: AppMessage = read_json0(&mut reader).await.unwrap();
        assert_eq!(app.name, "x");
    }

    #[test]
    fn blocking_helpers_interoperate_with_async_framing() {
        let msg = FileMessage {
            name: "a/b.txt".to_string(),
            size: 7,
            perm: 0o640,
        };
        let mut buf = Vec::new();
        write_json0_blocking(&mut buf, &msg).unwrap();

        let mut reader = std::io::BufReader::new(Cursor::new(buf));
        let decoded: FileMessage = read_json0_blocking(&mut reader).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn truncated_message_errors() {
        let data = br#"{"name":"x"}"#.to_vec(); // no trailing NUL
        let mut reader = BufReader::new(Cursor::new(data));
        let res: anyhow::Result<AppMessage> = read_json0(&mut reader).await;
        assert!(res.is_err());
    }
}
