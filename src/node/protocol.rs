use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// One control message. `hash` is the hex SHA-256 of `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub content: String,
    pub hash: String,
}

impl Packet {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = content_hash(&content);
        Self { content, hash }
    }

    pub fn verify(&self) -> bool {
        self.hash.trim().eq_ignore_ascii_case(&content_hash(&self.content))
    }
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug)]
pub enum Frame {
    Packet(Packet),
    /// The frame was read in full but is not a packet; the stream is still in sync.
    Malformed(String),
    Closed,
}

/// Reads one frame: a 4-byte big-endian length, then that many bytes of JSON.
///
/// Frames above `max_bytes` are an error; the caller must drop the connection because the
/// remaining bytes cannot be skipped reliably.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max_bytes: usize) -> anyhow::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Frame::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        anyhow::bail!("frame of {len} bytes exceeds limit of {max_bytes}");
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    match serde_json::from_slice::<Packet>(&body) {
        Ok(p) => Ok(Frame::Packet(p)),
        Err(e) => Ok(Frame::Malformed(e.to_string())),
    }
}

pub async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, packet: &Packet) -> anyhow::Result<()> {
    let body = serde_json::to_vec(packet)?;
    let len = u32::try_from(body.len())?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Minimal remote client: sends a command, waits for the reply packet.
pub struct Client {
    stream: TcpStream,
    max_bytes: usize,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            max_bytes: 1 << 20,
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> anyhow::Result<()> {
        write_packet(&mut self.stream, packet).await
    }

    /// Next reply; `None` once the node has closed the connection.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Packet>> {
        match read_frame(&mut self.stream, self.max_bytes).await? {
            Frame::Packet(p) => Ok(Some(p)),
            Frame::Malformed(e) => anyhow::bail!("malformed reply: {e}"),
            Frame::Closed => Ok(None),
        }
    }

    pub async fn call(&mut self, command: &str) -> anyhow::Result<String> {
        self.send(&Packet::new(command)).await?;
        match self.recv().await? {
            Some(p) if p.verify() => Ok(p.content),
            Some(_) => anyhow::bail!("reply failed hash check"),
            None => anyhow::bail!("connection closed by node"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256_and_case_insensitive() {
        let p = Packet::new("server list");
        assert_eq!(p.hash.len(), 64);
        assert!(p.verify());
        let upper = Packet {
            content: p.content.clone(),
            hash: p.hash.to_ascii_uppercase(),
        };
        assert!(upper.verify());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut p = Packet::new("server stop 0");
        p.content = "server stop 1".to_string();
        assert!(!p.verify());

        let mut q = Packet::new("help");
        let flipped = if q.hash.starts_with('0') { "1" } else { "0" };
        q.hash.replace_range(0..1, flipped);
        assert!(!q.verify());
    }

    #[tokio::test]
    async fn frames_cross_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_packet(&mut a, &Packet::new("version")).await.unwrap();
        a.write_all(&5u32.to_be_bytes()).await.unwrap();
        a.write_all(b"nope!").await.unwrap();
        drop(a);

        match read_frame(&mut b, 1024).await.unwrap() {
            Frame::Packet(p) => assert_eq!(p.content, "version"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(read_frame(&mut b, 1024).await.unwrap(), Frame::Malformed(_)));
        assert!(matches!(read_frame(&mut b, 1024).await.unwrap(), Frame::Closed));
    }

    #[tokio::test]
    async fn oversize_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&100_000u32.to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut b, 1024).await.is_err());
    }
}
