//! Connection-phase state machine.
//!
//! Drives handshake → optional SSLRequest/TLS upgrade → handshake
//! response → authentication exchange → command phase. Runs directly on
//! the channel before the exchange engine takes over.

use log::{debug, trace};

use myflux_core::{ConnectionErrorKind, Error, ProtocolErrorKind, Result};

use crate::auth::{caching_sha2, rsa_encrypt_password, AuthPlugin};
use crate::config::Config;
use crate::engine::Channel;
use crate::message::client::HandshakeResponse41;
use crate::message::server::decode;
use crate::message::{ClientMessage, ServerMessage};
use crate::protocol::{capabilities, DecodeContext};
use crate::session::{ServerVersion, Session};

/// Negotiate a session on the channel. On success the session is in the
/// command phase with credentials wiped.
pub(crate) async fn establish(
    channel: &mut Channel,
    config: &Config,
    session: &mut Session,
) -> Result<()> {
    let handshake = match decode(channel.read_message().await?, &DecodeContext::Connection, false)? {
        ServerMessage::Handshake(handshake) => handshake,
        ServerMessage::Err(err) => {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("server rejected connection: {}", err.message),
            ));
        }
        other => {
            return Err(Error::protocol(
                ProtocolErrorKind::NotSupported,
                format!("expected handshake, server sent {:?}", other),
            ));
        }
    };

    if handshake.capabilities & capabilities::PROTOCOL_41 == 0 {
        return Err(Error::protocol(
            ProtocolErrorKind::NotSupported,
            "server does not speak protocol 4.1",
        ));
    }

    session.connection_id = handshake.connection_id;
    session.server_version = ServerVersion::parse(&handshake.server_version);
    session.server_version_text = handshake.server_version.clone();
    session.server_capabilities = handshake.capabilities;
    session.collation = config.collation;
    session.status_flags = handshake.status_flags;
    session.scramble = handshake.scramble.clone();

    let plugin = match handshake.auth_plugin_name.as_deref() {
        Some(name) => AuthPlugin::from_name(name)?,
        None => AuthPlugin::Native,
    };
    session.auth_plugin = Some(plugin);

    let desired = config.capability_flags();
    let negotiated = desired & handshake.capabilities;
    session.capabilities = negotiated;
    debug!(
        "handshake from {} (connection {}), capabilities {:#010X}",
        handshake.server_version, handshake.connection_id, negotiated
    );

    if config.ssl_mode.is_required() && handshake.capabilities & capabilities::SSL == 0 {
        return Err(Error::connection(
            ConnectionErrorKind::Ssl,
            "TLS required but the server does not support it",
        ));
    }

    if negotiated & capabilities::SSL != 0 {
        channel
            .send(&ClientMessage::SslRequest {
                capabilities: negotiated,
                max_packet_size: config.max_packet_size,
                collation: config.collation,
            })
            .await?;
        crate::tls::upgrade(channel, config).await?;
        debug!("TLS established");
    }

    let password = session.password.clone().unwrap_or_default();
    let auth_response = plugin.fast_phase(&password, &session.scramble);
    ensure_channel_policy(plugin, channel.is_tls)?;

    let mut attributes: Vec<(String, String)> = config
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    attributes.sort();

    channel
        .send(&ClientMessage::HandshakeResponse(HandshakeResponse41 {
            capabilities: negotiated,
            max_packet_size: config.max_packet_size,
            collation: config.collation,
            username: session.username.clone(),
            auth_response,
            database: session.database.clone(),
            auth_plugin_name: (negotiated & capabilities::PLUGIN_AUTH != 0)
                .then(|| plugin.name().to_string()),
            attributes,
        }))
        .await?;

    auth_exchange(channel, session, &password).await
}

/// Plugins that only ever run over TLS are refused on plain channels.
/// `sha256_password` is exempt: it can hand off to RSA.
fn ensure_channel_policy(plugin: AuthPlugin, is_tls: bool) -> Result<()> {
    if plugin == AuthPlugin::Clear && !is_tls {
        return Err(Error::connection(
            ConnectionErrorKind::Authentication,
            "mysql_clear_password requires a TLS connection",
        ));
    }
    Ok(())
}

/// The post-response authentication loop.
async fn auth_exchange(channel: &mut Channel, session: &mut Session, password: &str) -> Result<()> {
    loop {
        match decode(channel.read_message().await?, &DecodeContext::Connection, false)? {
            ServerMessage::Ok(ok) => {
                session.status_flags = ok.status_flags;
                session.finish_authentication();
                debug!("authentication complete");
                return Ok(());
            }
            ServerMessage::Err(err) => {
                return Err(Error::connection(
                    ConnectionErrorKind::Authentication,
                    format!(
                        "authentication failed: {} ({})",
                        err.message, err.error_code
                    ),
                ));
            }
            ServerMessage::AuthChange(change) => {
                trace!("auth switch to {}", change.plugin_name);
                let plugin = AuthPlugin::from_name(&change.plugin_name)?;
                ensure_channel_policy(plugin, channel.is_tls)?;
                session.auth_plugin = Some(plugin);
                session.scramble = change.salt;

                let response = plugin.fast_phase(password, &session.scramble);
                channel.send(&ClientMessage::AuthResponse(response)).await?;
            }
            ServerMessage::AuthMoreData(more) => {
                let plugin = session.auth_plugin.unwrap_or(AuthPlugin::Native);
                match more.data.first() {
                    Some(&caching_sha2::FAST_AUTH_SUCCESS) => {
                        // Cached credentials matched; the OK follows.
                        trace!("fast auth success");
                    }
                    Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                        if channel.is_tls {
                            let response = plugin.full_phase(password).unwrap_or_default();
                            channel.send(&ClientMessage::AuthResponse(response)).await?;
                        } else {
                            // Ask for the server's RSA public key instead.
                            channel
                                .send(&ClientMessage::AuthResponse(vec![
                                    caching_sha2::REQUEST_PUBLIC_KEY,
                                ]))
                                .await?;
                        }
                    }
                    _ => {
                        // The payload is the server's RSA public key.
                        // OAEP padding from 8.0.5 on, PKCS#1 v1.5 before.
                        let use_oaep = session.server_version.at_least(8, 0, 5);
                        let encrypted = rsa_encrypt_password(
                            password,
                            &session.scramble,
                            &more.data,
                            use_oaep,
                        )?;
                        channel
                            .send(&ClientMessage::AuthResponse(encrypted))
                            .await?;
                    }
                }
            }
            other => {
                return Err(Error::protocol(
                    ProtocolErrorKind::NotSupported,
                    format!("unexpected {:?} during authentication", other),
                ));
            }
        }
    }
}
