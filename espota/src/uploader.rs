//! Upload orchestration: listen, invite, authenticate, stream.
//!
//! The phases run strictly in order. The TCP listener is bound before the
//! first invitation so the announced connect-back port is always live, the
//! UDP control exchange then negotiates the upload, and finally the device
//! connects back and the image is streamed:
//!
//! ```text
//! host                                device
//!  |  bind TCP listener               |
//!  |  UDP "<cmd> <port> <len> <md5>"->|
//!  |  <- "OK" / "AUTH <nonce>"        |
//!  | (UDP "200 <cnonce> <response>"->)|
//!  |  <- TCP connect-back             |
//!  |  image chunks ...             -> |
//! ```

use log::{debug, info, trace, warn};
use rand::Rng;
use std::io::{self, BufReader};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::is_interrupted_requested;
use crate::protocol::auth::{AuthAttempt, AuthOutcome, AuthScheme, UploadIdentity};
use crate::protocol::invite::{DeviceReply, Invitation};
use crate::protocol::stream::{StreamConfig, StreamOutcome, StreamTransfer};
use crate::protocol::{DEFAULT_DEVICE_PORT, INVITE_REPLY_MAX, UploadCommand};

/// Invitation datagrams sent before giving up.
const INVITE_ATTEMPTS: u32 = 10;

/// Default per-attempt invitation reply timeout.
const INVITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the device's verdict on an authentication response.
const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the device's connect-back after negotiation.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the connect-back.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Port range used when the caller does not pick a host port.
const HOST_PORT_RANGE: std::ops::RangeInclusive<u16> = 10000..=60000;

/// Attempts at binding a randomly chosen host port.
const BIND_ATTEMPTS: u32 = 10;

/// Everything needed for one upload run.
///
/// Built once from user input and immutable afterwards; the firmware
/// digest embedded in every invitation of the run comes from the staged
/// [`FirmwareImage`].
#[derive(Debug, Clone)]
pub struct UploadJob {
    device_addr: String,
    device_port: u16,
    bind_addr: String,
    host_port: Option<u16>,
    image: FirmwareImage,
    command: UploadCommand,
    password: String,
    invite_timeout: Duration,
    force_md5: bool,
    strict: bool,
}

impl UploadJob {
    /// Create a job with default settings for the given device and image.
    pub fn new(device_addr: impl Into<String>, image: FirmwareImage) -> Self {
        Self {
            device_addr: device_addr.into(),
            device_port: DEFAULT_DEVICE_PORT,
            bind_addr: "0.0.0.0".to_string(),
            host_port: None,
            image,
            command: UploadCommand::Flash,
            password: String::new(),
            invite_timeout: INVITE_TIMEOUT,
            force_md5: false,
            strict: false,
        }
    }

    /// Set the device's OTA control port.
    #[must_use]
    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    /// Set the local address the data-channel listener binds to.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Pin the connect-back port instead of picking a random one.
    #[must_use]
    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_port = Some(port);
        self
    }

    /// Announce a filesystem image instead of application firmware.
    #[must_use]
    pub fn with_command(mut self, command: UploadCommand) -> Self {
        self.command = command;
        self
    }

    /// Set the OTA password used when the device sends a challenge.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the per-attempt invitation reply timeout.
    #[must_use]
    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout = timeout;
        self
    }

    /// Answer 64-char challenges with the MD5 credential scheme directly,
    /// skipping the SHA-256 attempt and its automatic fallback.
    #[must_use]
    pub fn with_force_md5(mut self, force_md5: bool) -> Self {
        self.force_md5 = force_md5;
        self
    }

    /// Treat a degraded confirmation as a failure.
    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Device address as supplied by the user.
    pub fn device_addr(&self) -> &str {
        &self.device_addr
    }

    /// Device OTA control port.
    pub fn device_port(&self) -> u16 {
        self.device_port
    }

    /// The staged firmware image.
    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    /// Challenge-response inputs binding this job's derivations.
    fn identity(&self) -> UploadIdentity<'_> {
        UploadIdentity {
            filename: self.image.filename(),
            size: self.image.size(),
            md5_hex: self.image.md5_hex(),
            device_addr: &self.device_addr,
        }
    }
}

/// How an upload run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Device confirmed the upload with `OK`.
    Confirmed,
    /// Device consumed the whole image and replied, but the confirmation
    /// was truncated (usually by the reboot into the new firmware);
    /// carries the device's last words.
    Degraded(String),
}

/// Drives one upload from invitation to final confirmation.
pub struct Uploader {
    job: UploadJob,
    listener: TcpListener,
    host_port: u16,
}

impl Uploader {
    /// Bind the data-channel listener and prepare the run.
    ///
    /// Binding happens here, before any invitation is sent, so the port
    /// announced to the device is guaranteed to be live.
    pub fn new(job: UploadJob) -> Result<Self> {
        let (listener, host_port) = bind_listener(&job.bind_addr, job.host_port)?;
        debug!("Listening for connect-back on {}:{host_port}", job.bind_addr);
        Ok(Self {
            job,
            listener,
            host_port,
        })
    }

    /// Port the data-channel listener is bound to.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Run the upload, reporting `(sent, total)` after every chunk.
    pub fn run<F>(self, progress: &mut F) -> Result<UploadOutcome>
    where
        F: FnMut(u64, u64),
    {
        self.negotiate()?;

        let mut stream = self.wait_for_connect_back()?;
        let mut source = BufReader::new(self.job.image.reopen()?);
        let outcome = StreamTransfer::with_config(&mut stream, StreamConfig::default()).transfer(
            &mut source,
            self.job.image.size(),
            progress,
        )?;

        match outcome {
            StreamOutcome::Confirmed => {
                info!("Device confirmed the upload");
                Ok(UploadOutcome::Confirmed)
            }
            StreamOutcome::Degraded(text) if self.job.strict => Err(Error::Unconfirmed(text)),
            StreamOutcome::Degraded(text) => {
                warn!("Treating truncated confirmation as success (device likely rebooted)");
                Ok(UploadOutcome::Degraded(text))
            }
        }
    }

    /// Invite the device and, if challenged, climb the authentication
    /// ladder until it accepts.
    fn negotiate(&self) -> Result<()> {
        match self.invite()? {
            (_, DeviceReply::Ok) => {
                debug!("Device accepted the invitation without authentication");
                Ok(())
            }
            (socket, DeviceReply::AuthChallenge(nonce)) => self.authenticate(&socket, &nonce),
            (_, DeviceReply::Error(detail)) => Err(Error::UnexpectedReply(detail)),
        }
    }

    /// Send the invitation until the device answers.
    ///
    /// Each call opens a fresh UDP socket; the socket that received a
    /// challenge is returned so the authentication exchange reaches the
    /// device as the same peer.
    fn invite(&self) -> Result<(UdpSocket, DeviceReply)> {
        let invitation = Invitation {
            command: self.job.command,
            host_port: self.host_port,
            size: self.job.image.size(),
            md5_hex: self.job.image.md5_hex().to_string(),
        };
        let line = invitation.render();

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((self.job.device_addr.as_str(), self.job.device_port))?;
        socket.set_read_timeout(Some(self.job.invite_timeout))?;

        info!(
            "Inviting {}:{} to fetch {} ({} bytes)",
            self.job.device_addr,
            self.job.device_port,
            self.job.image.filename(),
            self.job.image.size()
        );

        for attempt in 1..=INVITE_ATTEMPTS {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            if attempt > 1 {
                debug!("No reply, resending invitation (attempt {attempt}/{INVITE_ATTEMPTS})");
            }

            socket.send(line.as_bytes())?;

            let mut buf = [0u8; INVITE_REPLY_MAX];
            match socket.recv(&mut buf) {
                Ok(n) => {
                    let reply = DeviceReply::parse(&buf[..n]);
                    trace!("Invitation reply: {reply:?}");
                    return Ok((socket, reply));
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Err(Error::NoResponse {
            attempts: INVITE_ATTEMPTS,
        })
    }

    /// Answer a challenge, falling back once from the SHA-256 scheme to
    /// the MD5 credential scheme after a rejection.
    ///
    /// The fallback needs a fresh nonce: the device returns to idle after
    /// a failed attempt and rejects a reused one, so the ladder re-invites
    /// before the second attempt.
    fn authenticate(&self, socket: &UdpSocket, nonce: &str) -> Result<()> {
        if self.job.password.is_empty() {
            warn!("Device requested authentication but no password is configured");
        }

        let scheme = AuthScheme::for_nonce(nonce, self.job.force_md5)?;
        match self.try_auth(socket, scheme, nonce)? {
            AuthOutcome::Accepted => {
                info!("Authenticated ({scheme:?})");
                return Ok(());
            }
            AuthOutcome::Rejected(detail) => {
                let Some(fallback) = scheme.fallback() else {
                    return Err(Error::AuthRejected(detail));
                };
                warn!("SHA-256 authentication rejected, retrying with the MD5 credential scheme");

                let (socket, reply) = self.invite()?;
                let DeviceReply::AuthChallenge(fresh_nonce) = reply else {
                    return Err(Error::UnexpectedReply(format!(
                        "expected a fresh challenge, got {reply:?}"
                    )));
                };

                match self.try_auth(&socket, fallback, &fresh_nonce)? {
                    AuthOutcome::Accepted => {
                        warn!(
                            "Authenticated with the deprecated MD5 credential hash; \
                             re-set the OTA password on current firmware to upgrade it"
                        );
                        Ok(())
                    }
                    AuthOutcome::Rejected(detail) => Err(Error::AuthRejected(detail)),
                }
            }
        }
    }

    /// Derive and send one challenge response, then read the verdict.
    ///
    /// A silent device counts as a rejection; only socket failures are
    /// fatal here.
    fn try_auth(&self, socket: &UdpSocket, scheme: AuthScheme, nonce: &str) -> Result<AuthOutcome> {
        let attempt = AuthAttempt::derive(scheme, &self.job.password, nonce, &self.job.identity());
        debug!("Answering challenge with the {scheme:?} scheme");

        socket.set_read_timeout(Some(AUTH_REPLY_TIMEOUT))?;
        socket.send(attempt.frame().as_bytes())?;

        let mut buf = vec![0u8; attempt.response().len()];
        match socket.recv(&mut buf) {
            Ok(n) => Ok(AuthOutcome::from_reply(&buf[..n])),
            Err(e) if is_timeout(&e) => Ok(AuthOutcome::Rejected(
                "no reply to the authentication response".to_string(),
            )),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Wait for the device to open the data connection.
    fn wait_for_connect_back(&self) -> Result<TcpStream> {
        debug!("Waiting for the device to connect back on port {}", self.host_port);
        self.listener.set_nonblocking(true)?;

        let start = Instant::now();
        while start.elapsed() < ACCEPT_TIMEOUT {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("Device connected from {peer}");
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Err(Error::Timeout(format!(
            "device never opened the data connection within {} seconds",
            ACCEPT_TIMEOUT.as_secs()
        )))
    }
}

/// Bind the connect-back listener.
///
/// A caller-chosen port that fails to bind is fatal; a random pick is
/// retried on a new port within the range.
fn bind_listener(bind_addr: &str, host_port: Option<u16>) -> Result<(TcpListener, u16)> {
    if let Some(port) = host_port {
        let listener = TcpListener::bind((bind_addr, port))?;
        return Ok((listener, port));
    }

    let mut rng = rand::thread_rng();
    let mut last_error = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(HOST_PORT_RANGE);
        match TcpListener::bind((bind_addr, port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!("Port {port} in use, picking another");
                last_error = Some(e);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Err(Error::Io(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "no free connect-back port")
    })))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    fn test_image(dir: &tempfile::TempDir) -> FirmwareImage {
        let path: PathBuf = dir.path().join("app.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0x5A; 100]).unwrap();
        FirmwareImage::open(&path).unwrap()
    }

    #[test]
    fn test_job_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let job = UploadJob::new("192.168.1.50", test_image(&dir));

        assert_eq!(job.device_addr(), "192.168.1.50");
        assert_eq!(job.device_port(), DEFAULT_DEVICE_PORT);
        assert_eq!(job.bind_addr, "0.0.0.0");
        assert!(job.host_port.is_none());
        assert_eq!(job.command, UploadCommand::Flash);
        assert!(job.password.is_empty());
        assert!(!job.force_md5);
        assert!(!job.strict);
    }

    #[test]
    fn test_job_builders() {
        let dir = tempfile::tempdir().unwrap();
        let job = UploadJob::new("10.0.0.1", test_image(&dir))
            .with_device_port(8266)
            .with_bind_addr("127.0.0.1")
            .with_host_port(42424)
            .with_command(UploadCommand::Spiffs)
            .with_password("secret")
            .with_invite_timeout(Duration::from_secs(3))
            .with_force_md5(true)
            .with_strict(true);

        assert_eq!(job.device_port(), 8266);
        assert_eq!(job.bind_addr, "127.0.0.1");
        assert_eq!(job.host_port, Some(42424));
        assert_eq!(job.command, UploadCommand::Spiffs);
        assert_eq!(job.password, "secret");
        assert_eq!(job.invite_timeout, Duration::from_secs(3));
        assert!(job.force_md5);
        assert!(job.strict);
    }

    #[test]
    fn test_identity_mirrors_job_and_image() {
        let dir = tempfile::tempdir().unwrap();
        let job = UploadJob::new("10.0.0.7", test_image(&dir));
        let identity = job.identity();

        assert_eq!(identity.filename, "app.bin");
        assert_eq!(identity.size, 100);
        assert_eq!(identity.md5_hex, job.image().md5_hex());
        assert_eq!(identity.device_addr, "10.0.0.7");
    }

    #[test]
    fn test_bind_listener_random_port_in_range() {
        let (listener, port) = bind_listener("127.0.0.1", None).unwrap();
        assert!(HOST_PORT_RANGE.contains(&port));
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_bind_listener_honors_explicit_port() {
        // Grab a free port from the OS, release it, then ask for it back.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (_, bound) = bind_listener("127.0.0.1", Some(port)).unwrap();
        assert_eq!(bound, port);
    }

    #[test]
    fn test_bind_listener_explicit_port_conflict_is_fatal() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        assert!(matches!(
            bind_listener("127.0.0.1", Some(port)),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_uploader_announces_the_port_it_bound() {
        let dir = tempfile::tempdir().unwrap();
        let job = UploadJob::new("127.0.0.1", test_image(&dir)).with_bind_addr("127.0.0.1");

        let uploader = Uploader::new(job).unwrap();
        assert_eq!(
            uploader.listener.local_addr().unwrap().port(),
            uploader.host_port()
        );
    }
}
