// SIP Digest 认证（RFC 2617，MD5 算法）
// 设备侧：解析平台 401 挑战，计算响应并组装 Authorization 头

use rand::Rng;
use std::fmt::Write as _;

/// 平台下发的 Digest 挑战参数
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

/// 解析 WWW-Authenticate / Proxy-Authenticate 头部值
///
/// 宽松解析：参数值带不带引号都接受，algorithm 缺省按 MD5 处理。
pub fn parse_digest_challenge(header_value: &str) -> Option<DigestChallenge> {
    let trimmed = header_value.trim();
    if !trimmed.to_ascii_lowercase().starts_with("digest") {
        return None;
    }
    let params = trimmed[6..].trim_start();

    let mut realm = None;
    let mut nonce = None;
    let mut algorithm = None;
    let mut qop = None;
    let mut opaque = None;

    for part in split_quoted_params(params) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().trim_matches('"').to_string();
        match key.as_str() {
            "realm" => realm = Some(value),
            "nonce" => nonce = Some(value),
            "algorithm" => algorithm = Some(value),
            "qop" => qop = Some(value),
            "opaque" => opaque = Some(value),
            _ => {}
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        algorithm,
        qop,
        opaque,
    })
}

/// 计算 Digest 响应值
///
/// qop 为空：response = MD5(HA1:nonce:HA2)
/// qop=auth：response = MD5(HA1:nonce:nc:cnonce:auth:HA2)，nc 固定 00000001
pub fn digest_response(
    method: &str,
    uri: &str,
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    qop: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(format!("{}:{}:{}", username, realm, password).as_bytes());
    let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
    match qop {
        Some(qop_value) => md5_hex(
            format!(
                "{}:{}:00000001:{}:{}:{}",
                ha1,
                nonce,
                cnonce.unwrap_or(""),
                qop_value,
                ha2
            )
            .as_bytes(),
        ),
        None => md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
    }
}

/// 根据挑战组装 Authorization 头部值
///
/// 不支持 MD5 以外的算法时返回 None，由调用方按认证失败处理。
pub fn build_authorization(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
) -> Option<String> {
    if let Some(algorithm) = challenge.algorithm.as_deref() {
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return None;
        }
    }

    let qop = challenge.qop.as_deref().and_then(select_auth_qop);
    let cnonce = qop.map(|_| random_cnonce());

    let response = digest_response(
        method,
        uri,
        username,
        &challenge.realm,
        password,
        &challenge.nonce,
        qop,
        cnonce.as_deref(),
    );

    let mut params = vec![
        format!("username=\"{}\"", username),
        format!("realm=\"{}\"", challenge.realm),
        format!("nonce=\"{}\"", challenge.nonce),
        format!("uri=\"{}\"", uri),
        format!("response=\"{}\"", response),
        "algorithm=MD5".to_string(),
    ];
    if let Some(opaque) = challenge.opaque.as_deref() {
        params.push(format!("opaque=\"{}\"", opaque));
    }
    if let Some(qop_value) = qop {
        params.push(format!("qop={}", qop_value));
        params.push("nc=00000001".to_string());
        params.push(format!("cnonce=\"{}\"", cnonce.unwrap_or_default()));
    }

    Some(format!("Digest {}", params.join(", ")))
}

fn select_auth_qop(raw: &str) -> Option<&'static str> {
    raw.split(',')
        .map(|token| token.trim())
        .find(|token| token.eq_ignore_ascii_case("auth"))
        .map(|_| "auth")
}

/// 每次挑战随机生成 8 位十六进制 cnonce
fn random_cnonce() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// 按逗号切分参数，引号内的逗号不作分隔
fn split_quoted_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, ch) in input.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        }
        if ch == ',' && !in_quotes {
            parts.push(input[start..idx].trim());
            start = idx + 1;
        }
    }
    if start < input.len() {
        parts.push(input[start..].trim());
    }
    parts
}

pub fn md5_hex(input: &[u8]) -> String {
    let digest = md5(input);
    let mut out = String::with_capacity(32);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// MD5（RFC 1321），返回 16 字节摘要
pub fn md5(input: &[u8]) -> [u8; 16] {
    let mut msg = input.to_vec();
    let bit_len = (msg.len() as u64).wrapping_mul(8);
    msg.push(0x80);
    while msg.len() % 64 != 56 {
        msg.push(0);
    }
    msg.extend_from_slice(&bit_len.to_le_bytes());

    let mut a0: u32 = 0x6745_2301;
    let mut b0: u32 = 0xefcd_ab89;
    let mut c0: u32 = 0x98ba_dcfe;
    let mut d0: u32 = 0x1032_5476;

    for chunk in msg.chunks(64) {
        let mut m = [0u32; 16];
        for (i, word) in m.iter_mut().enumerate() {
            let offset = i * 4;
            *word = u32::from_le_bytes([
                chunk[offset],
                chunk[offset + 1],
                chunk[offset + 2],
                chunk[offset + 3],
            ]);
        }

        let mut a = a0;
        let mut b = b0;
        let mut c = c0;
        let mut d = d0;

        for i in 0..64 {
            let (f, g) = match i {
                0..=15 => ((b & c) | (!b & d), i),
                16..=31 => ((d & b) | (!d & c), (5 * i + 1) % 16),
                32..=47 => (b ^ c ^ d, (3 * i + 5) % 16),
                _ => (c ^ (b | !d), (7 * i) % 16),
            };
            let temp = d;
            d = c;
            c = b;
            b = b.wrapping_add(
                (a.wrapping_add(f).wrapping_add(MD5_K[i]).wrapping_add(m[g]))
                    .rotate_left(MD5_S[i]),
            );
            a = temp;
        }

        a0 = a0.wrapping_add(a);
        b0 = b0.wrapping_add(b);
        c0 = c0.wrapping_add(c);
        d0 = d0.wrapping_add(d);
    }

    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&a0.to_le_bytes());
    out[4..8].copy_from_slice(&b0.to_le_bytes());
    out[8..12].copy_from_slice(&c0.to_le_bytes());
    out[12..16].copy_from_slice(&d0.to_le_bytes());
    out
}

const MD5_S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9,
    14, 20, 5, 9, 14, 20, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 6, 10, 15,
    21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

const MD5_K: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];
