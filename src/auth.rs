//! MySQL 인증 처리
//!
//! mysql_native_password, caching_sha2_password (fast auth) 와
//! auth switch 요청을 처리합니다.

use crate::error::{ReplicationError, Result};
use crate::protocol::{self, GreetingPacket, PacketChannel, ERR_HEADER, OK_HEADER};
use byteorder::{LittleEndian, WriteBytesExt};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Write;
use tracing::debug;

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

const AUTH_SWITCH_HEADER: u8 = 0xFE;
const AUTH_MORE_DATA_HEADER: u8 = 0x01;
const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;

/// utf8mb4_general_ci
pub const DEFAULT_COLLATION: u8 = 45;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = Sha1::digest(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = Sha1::digest(stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    // XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 응답
///
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn create_sha2_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(scramble);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// 플러그인 이름에 맞는 인증 응답
pub fn auth_response_for(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Ok(create_auth_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(create_sha2_auth_response(password, scramble)),
        other => Err(ReplicationError::ConnectionError(format!(
            "unsupported authentication plugin {}",
            other
        ))),
    }
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
    plugin: &str,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;

    if database.is_some() {
        capabilities |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(capabilities)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = auth_response_for(plugin, password, scramble)?;
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(plugin.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// greeting 이후의 인증 교환 전체
pub async fn authenticate(
    channel: &mut PacketChannel,
    greeting: &GreetingPacket,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut plugin = greeting.auth_plugin_name.clone();
    if plugin != NATIVE_PASSWORD && plugin != CACHING_SHA2_PASSWORD {
        plugin = NATIVE_PASSWORD.to_string();
    }

    let response = create_handshake_response(
        username,
        password,
        None,
        &greeting.scramble,
        DEFAULT_COLLATION,
        &plugin,
    )?;
    channel.write_packet(&response).await?;

    loop {
        let packet = channel.read_packet().await?;
        match packet.first() {
            Some(&OK_HEADER) => {
                debug!("Authenticated as {} with {}", username, plugin);
                return Ok(());
            }
            Some(&ERR_HEADER) => {
                return Err(match protocol::parse_error_packet(&packet) {
                    ReplicationError::ServerError { code, state, message } => {
                        ReplicationError::ConnectionError(format!(
                            "authentication failed: {} ({}): {}",
                            code, state, message
                        ))
                    }
                    other => other,
                })
            }
            Some(&AUTH_SWITCH_HEADER) => {
                let (name, scramble) = parse_auth_switch(&packet[1..]);
                debug!("Auth switch requested to {}", name);
                let response = auth_response_for(&name, password, &scramble)?;
                channel.write_packet(&response).await?;
                plugin = name;
            }
            Some(&AUTH_MORE_DATA_HEADER) if plugin == CACHING_SHA2_PASSWORD => {
                match packet.get(1) {
                    Some(&FAST_AUTH_SUCCESS) => continue,
                    Some(&PERFORM_FULL_AUTH) => {
                        return Err(ReplicationError::ConnectionError(
                            "caching_sha2_password full authentication requires a secure connection"
                                .to_string(),
                        ))
                    }
                    other => {
                        return Err(ReplicationError::ProtocolError(format!(
                            "unexpected caching_sha2_password state {:?}",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(ReplicationError::ProtocolError(format!(
                    "unexpected authentication packet header {:?}",
                    other
                )))
            }
        }
    }
}

/// 플러그인 이름(NUL 종료) + scramble(마지막 NUL 제외)
fn parse_auth_switch(data: &[u8]) -> (String, Vec<u8>) {
    let name_end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let name = String::from_utf8_lossy(&data[..name_end]).to_string();
    let mut scramble = data.get(name_end + 1..).unwrap_or_default().to_vec();
    if scramble.last() == Some(&0) {
        scramble.pop();
    }
    (name, scramble)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_auth_response_empty_password() {
        let response = create_auth_response("", &[1, 2, 3, 4]);
        assert!(response.is_empty());
    }

    #[test]
    fn test_create_auth_response() {
        let scramble = vec![0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29];
        let response = create_auth_response("password", &scramble);
        assert_eq!(response.len(), 20); // SHA1 produces 20 bytes
    }

    #[test]
    fn test_native_response_is_reversible_by_server() {
        // 서버는 SHA1(SHA1(password)) 만 알고 있음
        let scramble = b"01234567890123456789";
        let response = create_auth_response("secret", scramble);

        let stored = Sha1::digest(Sha1::digest(b"secret"));
        let mut hasher = Sha1::new();
        hasher.update(scramble);
        hasher.update(stored);
        let mask = hasher.finalize();

        let candidate: Vec<u8> = response.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&candidate).to_vec(), stored.to_vec());
    }

    #[test]
    fn test_create_sha2_auth_response() {
        let response = create_sha2_auth_response("password", b"01234567890123456789");
        assert_eq!(response.len(), 32);
        assert!(auth_response_for("sha256_password", "password", b"x").is_err());
    }

    #[test]
    fn test_create_handshake_response() {
        let scramble = vec![0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29];
        let packet = create_handshake_response(
            "root",
            "password",
            Some("testdb"),
            &scramble,
            DEFAULT_COLLATION,
            NATIVE_PASSWORD,
        )
        .unwrap();

        assert!(packet.len() > 50);
        assert!(packet.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_parse_auth_switch() {
        let mut data = b"caching_sha2_password\0".to_vec();
        data.extend_from_slice(b"abcdefghij0123456789\0");
        let (name, scramble) = parse_auth_switch(&data);
        assert_eq!(name, CACHING_SHA2_PASSWORD);
        assert_eq!(scramble, b"abcdefghij0123456789");
    }
}
