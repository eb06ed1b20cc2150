//! HMAC-SHA256 request signatures used by the HTTP venues.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::exchange::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

fn digest(secret: &str, payload: &str) -> Result<Vec<u8>, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("unusable api secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Lower-case hex digest (Binance).
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    digest(secret, payload).map(hex::encode)
}

/// Base64 digest (OKX).
pub fn hmac_sha256_base64(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    digest(secret, payload).map(|bytes| STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_documented_signature() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            hmac_sha256_hex(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn base64_and_hex_encode_the_same_digest() {
        let hex_sig = hmac_sha256_hex("secret", "payload").unwrap();
        let b64_sig = hmac_sha256_base64("secret", "payload").unwrap();
        let decoded = STANDARD.decode(b64_sig).unwrap();
        assert_eq!(hex::encode(decoded), hex_sig);
    }
}
