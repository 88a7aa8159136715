//! Establishes new IMAP connections.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_imap::Client as ImapClient;
use tokio::net::TcpStream;

use super::session::{ImapSession, TlsStream};
use crate::account::Credentials;

/// IMAP connect timeout.
pub(crate) const IMAP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub(crate) struct Client {
    inner: ImapClient<TlsStream>,
}

impl Deref for Client {
    type Target = ImapClient<TlsStream>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// XOAUTH2 SASL initial response.
#[derive(Debug)]
struct OAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for OAuth2 {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Determine server capabilities the sync engine cares about.
async fn determine_capabilities(
    session: &mut async_imap::Session<TlsStream>,
) -> Result<(bool, bool)> {
    let caps = session
        .capabilities()
        .await
        .context("CAPABILITY command error")?;
    let can_condstore = caps.has_str("CONDSTORE");
    let is_gmail = caps.has_str("X-GM-EXT-1");
    Ok((can_condstore, is_gmail))
}

impl Client {
    /// Opens a TLS connection and reads the server greeting.
    pub async fn connect_secure(hostname: &str, port: u16) -> Result<Self> {
        let tcp_stream = tokio::time::timeout(IMAP_TIMEOUT, TcpStream::connect((hostname, port)))
            .await
            .context("connect timed out")?
            .with_context(|| format!("failed to connect to {hostname}:{port}"))?;

        let tls = async_native_tls::TlsConnector::new();
        let tls_stream: TlsStream = tls
            .connect(hostname, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake with {hostname} failed"))?;
        let mut client = ImapClient::new(tls_stream);

        let _greeting = client
            .read_response()
            .await
            .context("failed to read greeting")?;

        Ok(Client { inner: client })
    }

    /// Logs in with the given credentials and returns a usable session.
    pub async fn login(self, credentials: &Credentials) -> Result<ImapSession> {
        let Client { inner } = self;
        let mut session = match credentials {
            Credentials::Password { user, password } => inner
                .login(user, password)
                .await
                .map_err(|(err, _client)| err)?,
            Credentials::OAuth2 { user, access_token } => {
                let auth = OAuth2 {
                    user: user.clone(),
                    access_token: access_token.clone(),
                };
                inner
                    .authenticate("XOAUTH2", auth)
                    .await
                    .map_err(|(err, _client)| err)?
            }
        };
        let (can_condstore, is_gmail) = determine_capabilities(&mut session).await?;
        Ok(ImapSession::new(session, can_condstore, is_gmail))
    }
}
