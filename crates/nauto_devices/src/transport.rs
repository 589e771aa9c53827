use anyhow::{Context, Result};
use async_ssh2_tokio::{AuthMethod, Client, ServerCheckMethod};
use nauto_model::{Credential, Device};
use nauto_security::{CredentialStore, KeyringStore};
use nauto_transport::{FrameMode, FramedReader, FramedWriter};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

pub const DEFAULT_NETCONF_PORT: u16 = 830;

/// Any full-duplex byte stream the framed transport can ride on — an SSH
/// "netconf" subsystem channel, or a `tokio::io::duplex` pair in tests.
pub trait NetconfIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetconfIo for T {}

/// A connected NETCONF session: framed reader/writer halves plus the SSH
/// client keeping the channel alive (dropping it closes the session).
pub struct Connection {
    pub reader: FramedReader<ReadHalf<Box<dyn NetconfIo>>>,
    pub writer: FramedWriter<WriteHalf<Box<dyn NetconfIo>>>,
    _client: Option<Client>,
}

impl Connection {
    pub fn from_io(io: Box<dyn NetconfIo>, mode: FrameMode, client: Option<Client>) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Connection {
            reader: FramedReader::new(read_half, mode),
            writer: FramedWriter::new(write_half, mode),
            _client: client,
        }
    }
}

/// Opens the SSH transport and the "netconf" subsystem channel, grounded
/// directly on the teacher's `juniper_junos.rs::NetconfSession::connect`
/// (generalized here to be the only device connection path, since every
/// device speaks NETCONF rather than a vendor-specific CLI).
pub async fn connect_ssh(
    device: &Device,
    store: &KeyringStore,
    mode: FrameMode,
) -> Result<Connection> {
    let credential = store
        .resolve(&device.credential)
        .await
        .with_context(|| format!("loading credential {}", device.credential.name))?;
    let (username, auth) = credential_to_auth(&credential).await?;
    let port = device.transport.port.unwrap_or(DEFAULT_NETCONF_PORT);

    let client = Client::connect(
        (device.transport.address.as_str(), port),
        &username,
        auth,
        ServerCheckMethod::DefaultKnownHostsFile,
    )
    .await
    .with_context(|| format!("ssh connect {} ({})", device.name, device.transport.address))?;

    let channel = client
        .get_channel()
        .await
        .with_context(|| format!("netconf channel {}", device.name))?;
    channel
        .request_subsystem(true, "netconf")
        .await
        .context("netconf subsystem denied")?;
    let stream = channel.into_stream();
    let io: Box<dyn NetconfIo> = Box::new(stream);
    Ok(Connection::from_io(io, mode, Some(client)))
}

async fn credential_to_auth(credential: &Credential) -> Result<(String, AuthMethod)> {
    match credential {
        Credential::UserPassword { username, password } => {
            Ok((username.clone(), AuthMethod::with_password(password)))
        }
        Credential::SshKey { username, key_path, passphrase } => {
            let key_content = tokio::fs::read_to_string(Path::new(key_path))
                .await
                .with_context(|| format!("reading ssh key {key_path}"))?;
            Ok((username.clone(), AuthMethod::with_key(&key_content, passphrase.as_deref())))
        }
    }
}

/// An in-memory duplex pair for tests (spec.md §8 scenarios S1-S6),
/// grounded on the teacher's `MockDriver` idea of a test double the test
/// can script to fail or hang.
pub struct MockDeviceTransport;

impl MockDeviceTransport {
    /// Returns `(controller_side, peer_side)`, each boxed as `NetconfIo`
    /// so they plug into `Connection::from_io` exactly like a real SSH
    /// channel.
    pub fn pair() -> (Box<dyn NetconfIo>, Box<dyn NetconfIo>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }
}

