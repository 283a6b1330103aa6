// RTMP handshake utils

use std::{sync::LazyLock, time::Duration};

use hmac::{Hmac, Mac};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    base::{StreamError, StreamResult},
    log::Logger,
    log_debug,
    utils::bytes_compare_constant_time,
};

use super::{RTMP_HANDSHAKE_SIZE, RTMP_HANDSHAKE_TIMEOUT_SECONDS, RTMP_VERSION};

// Consts for handshake

const GENUINE_FP: &str = "Genuine Adobe Flash Player 001";
const GENUINE_FMS: &str = "Genuine Adobe Flash Media Server 001";

const RANDOM_CRUD: &[u8] = &[
    0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e,
    0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb,
    0x31, 0xae,
];

const SHA256DL: usize = 32;
const SHA256K: usize = 32;

/// Handshake mode detected from C1
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeFormat {
    /// Plain echo handshake
    Simple,

    /// Digest embedded in the first half of C1
    DigestFirst,

    /// Digest embedded in the second half of C1
    DigestSecond,
}

static GENUINE_FMS_PLUS_CRUD: LazyLock<Vec<u8>> = LazyLock::new(|| {
    let mut v = GENUINE_FMS.as_bytes().to_vec();
    v.extend_from_slice(RANDOM_CRUD);
    v
});

/// Generates full RTMP handshake response
///
/// # Arguments
///
/// * `client_signature` - C1, 1536 bytes
/// * `logger` - Logger of the RTMP session
pub fn generate_s0_s1_s2(client_signature: &[u8], logger: &Logger) -> StreamResult<Vec<u8>> {
    if client_signature.len() != RTMP_HANDSHAKE_SIZE {
        return Err(StreamError::ProtocolViolation(format!(
            "C1 must be {} bytes, found {}",
            RTMP_HANDSHAKE_SIZE,
            client_signature.len()
        )));
    }

    let msg_format = detect_client_message_format(client_signature);

    let mut all_bytes: Vec<u8> = Vec::with_capacity(1 + 2 * RTMP_HANDSHAKE_SIZE);

    all_bytes.push(RTMP_VERSION);

    if msg_format == HandshakeFormat::Simple {
        log_debug!(logger, "Using basic handshake");

        all_bytes.extend_from_slice(client_signature);
        all_bytes.extend_from_slice(client_signature);
    } else {
        log_debug!(logger, format!("Using digest handshake: {:?}", msg_format));

        all_bytes.extend(generate_s1(msg_format));
        all_bytes.extend(generate_s2(msg_format, client_signature));
    }

    Ok(all_bytes)
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0; n];
    StdRng::from_os_rng().fill_bytes(&mut bytes);
    bytes
}

/// Computes the digest offset for a handshake format
fn digest_offset(msg_format: HandshakeFormat, block: &[u8]) -> usize {
    match msg_format {
        HandshakeFormat::DigestSecond => get_server_genuine_const_digest_offset(&block[772..776]),
        _ => get_client_genuine_const_digest_offset(&block[8..12]),
    }
}

/// Computes the digest of a block, skipping the digest window
fn block_digest(block: &[u8], offset: usize, key: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(RTMP_HANDSHAKE_SIZE - SHA256DL);
    msg.extend_from_slice(&block[..offset]);
    msg.extend_from_slice(&block[offset + SHA256DL..]);
    calc_hmac(&msg, key)
}

/// Generates RTMP handshake response (S1)
fn generate_s1(msg_format: HandshakeFormat) -> Vec<u8> {
    let mut handshake_bytes: Vec<u8> = vec![0, 0, 0, 0, 1, 2, 3, 4];

    handshake_bytes.extend(random_bytes(RTMP_HANDSHAKE_SIZE - 8));

    let offset = digest_offset(msg_format, &handshake_bytes);
    let h = block_digest(&handshake_bytes, offset, GENUINE_FMS.as_bytes());

    handshake_bytes[offset..offset + SHA256DL].copy_from_slice(&h);

    handshake_bytes
}

/// Generates RTMP handshake response (S2)
fn generate_s2(msg_format: HandshakeFormat, client_signature: &[u8]) -> Vec<u8> {
    let mut s2_bytes = random_bytes(RTMP_HANDSHAKE_SIZE - SHA256DL);

    let challenge_key_offset = digest_offset(msg_format, client_signature);
    let challenge_key = &client_signature[challenge_key_offset..challenge_key_offset + SHA256K];

    let h = calc_hmac(challenge_key, &GENUINE_FMS_PLUS_CRUD);
    let signature = calc_hmac(&s2_bytes, &h);

    s2_bytes.extend(signature);

    s2_bytes
}

/// Calculates HMAC
fn calc_hmac(message: &[u8], key: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };

    mac.update(message);

    mac.finalize().into_bytes().to_vec()
}

/// Detects message format from client signature
pub fn detect_client_message_format(client_signature: &[u8]) -> HandshakeFormat {
    if client_signature.len() < RTMP_HANDSHAKE_SIZE || client_signature[4..8] == [0, 0, 0, 0] {
        return HandshakeFormat::Simple;
    }

    for msg_format in [HandshakeFormat::DigestSecond, HandshakeFormat::DigestFirst] {
        let offset = digest_offset(msg_format, client_signature);
        let computed = block_digest(client_signature, offset, GENUINE_FP.as_bytes());

        if bytes_compare_constant_time(&computed, &client_signature[offset..offset + SHA256DL]) {
            return msg_format;
        }
    }

    HandshakeFormat::Simple
}

/// Gets the basic digest of the RTMP Genuine const of the client
fn get_client_genuine_const_digest_offset(buf: &[u8]) -> usize {
    (buf.iter().take(4).map(|b| *b as usize).sum::<usize>() % 728) + 12
}

/// Gets the basic digest of the RTMP Genuine const of the server
fn get_server_genuine_const_digest_offset(buf: &[u8]) -> usize {
    (buf.iter().take(4).map(|b| *b as usize).sum::<usize>() % 728) + 776
}

async fn with_handshake_timeout<F, T>(what: &str, f: F) -> StreamResult<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(RTMP_HANDSHAKE_TIMEOUT_SECONDS), f).await {
        Ok(r) => Ok(r?),
        Err(_) => Err(StreamError::timed_out(what)),
    }
}

/// Runs the server side of the handshake on a connection
///
/// # Arguments
///
/// * `stream` - Connection stream
/// * `logger` - Session logger
pub async fn server_handshake<S>(stream: &mut S, logger: &Logger) -> StreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0 = [0u8; 1];
    with_handshake_timeout("C0", stream.read_exact(&mut c0)).await?;

    if c0[0] != RTMP_VERSION {
        log_debug!(logger, format!("Unexpected RTMP version: {}", c0[0]));
    }

    let mut c1 = vec![0u8; RTMP_HANDSHAKE_SIZE];
    with_handshake_timeout("C1", stream.read_exact(&mut c1)).await?;

    let response = generate_s0_s1_s2(&c1, logger)?;
    with_handshake_timeout("S0S1S2", stream.write_all(&response)).await?;

    // C2 is read and ignored
    with_handshake_timeout("C2", stream.read_exact(&mut c1)).await?;

    Ok(())
}

/// Runs the client side of the handshake (simple mode)
pub async fn client_handshake<S>(stream: &mut S) -> StreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = Vec::with_capacity(1 + RTMP_HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
    c0c1.extend(random_bytes(RTMP_HANDSHAKE_SIZE - 8));

    with_handshake_timeout("C0C1", stream.write_all(&c0c1)).await?;

    let mut s0s1s2 = vec![0u8; 1 + 2 * RTMP_HANDSHAKE_SIZE];
    with_handshake_timeout("S0S1S2", stream.read_exact(&mut s0s1s2)).await?;

    // C2 echoes S1
    let c2 = &s0s1s2[1..1 + RTMP_HANDSHAKE_SIZE];
    with_handshake_timeout("C2", stream.write_all(c2)).await?;

    Ok(())
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn make_complex_c1(msg_format: HandshakeFormat) -> Vec<u8> {
        let mut c1 = vec![0, 0, 0, 0, 0x80, 0x00, 0x07, 0x02];
        c1.extend(random_bytes(RTMP_HANDSHAKE_SIZE - 8));

        let offset = digest_offset(msg_format, &c1);
        let digest = block_digest(&c1, offset, GENUINE_FP.as_bytes());
        c1[offset..offset + SHA256DL].copy_from_slice(&digest);

        c1
    }

    #[test]
    fn test_handshake_simple_echoes_c1() {
        let logger = Logger::new_disabled();
        let mut c1 = vec![0u8; 8];
        c1.extend(random_bytes(RTMP_HANDSHAKE_SIZE - 8));

        let response = generate_s0_s1_s2(&c1, &logger).unwrap();

        assert_eq!(response.len(), 1 + 2 * RTMP_HANDSHAKE_SIZE);
        assert_eq!(response[0], RTMP_VERSION);
        assert_eq!(&response[1..1 + RTMP_HANDSHAKE_SIZE], &c1[..]);
        assert_eq!(&response[1 + RTMP_HANDSHAKE_SIZE..], &c1[..]);
    }

    #[test]
    fn test_handshake_detects_digest_formats() {
        for msg_format in [HandshakeFormat::DigestFirst, HandshakeFormat::DigestSecond] {
            let c1 = make_complex_c1(msg_format);
            assert_eq!(detect_client_message_format(&c1), msg_format);
        }
    }

    #[test]
    fn test_handshake_complex_s1_s2_verify() {
        let logger = Logger::new_disabled();
        let c1 = make_complex_c1(HandshakeFormat::DigestFirst);

        let response = generate_s0_s1_s2(&c1, &logger).unwrap();
        assert_eq!(response.len(), 1 + 2 * RTMP_HANDSHAKE_SIZE);

        let s1 = &response[1..1 + RTMP_HANDSHAKE_SIZE];
        let offset = digest_offset(HandshakeFormat::DigestFirst, s1);
        assert_eq!(
            block_digest(s1, offset, GENUINE_FMS.as_bytes()),
            s1[offset..offset + SHA256DL].to_vec()
        );

        let s2 = &response[1 + RTMP_HANDSHAKE_SIZE..];
        let key_offset = digest_offset(HandshakeFormat::DigestFirst, &c1);
        let h = calc_hmac(&c1[key_offset..key_offset + SHA256K], &GENUINE_FMS_PLUS_CRUD);
        assert_eq!(
            calc_hmac(&s2[..RTMP_HANDSHAKE_SIZE - SHA256DL], &h),
            s2[RTMP_HANDSHAKE_SIZE - SHA256DL..].to_vec()
        );
    }

    #[test]
    fn test_handshake_constants() {
        assert_eq!(GENUINE_FP.len() + RANDOM_CRUD.len(), 62);
        assert_eq!(GENUINE_FMS_PLUS_CRUD.len(), 68);
    }

    #[tokio::test]
    async fn test_handshake_client_against_server() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        let server_task = tokio::spawn(async move {
            let logger = Logger::new_disabled();
            server_handshake(&mut server, &logger).await
        });

        client_handshake(&mut client).await.unwrap();
        server_task.await.unwrap().unwrap();
    }
}
