use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// How long the first QR stays valid before rotating.
pub const INITIAL_QR_TIMEOUT: Duration = Duration::from_secs(60);

/// Validity of every subsequent QR.
pub const SUBSEQUENT_QR_TIMEOUT: Duration = Duration::from_secs(20);

/// Builds the QR payload in the expected comma-separated format.
pub fn generate_qr_string(
    reference: &str,
    noise_pub: &[u8; 32],
    identity_pub: &[u8; 32],
    adv_secret: &[u8; 32],
) -> String {
    format!(
        "{reference},{},{},{}",
        STANDARD.encode(noise_pub),
        STANDARD.encode(identity_pub),
        STANDARD.encode(adv_secret)
    )
}

#[cfg(test)]
mod tests {
    use super::generate_qr_string;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn qr_string_has_four_comma_separated_fields() {
        let qr = generate_qr_string("2@abc", &[1; 32], &[2; 32], &[3; 32]);
        let fields: Vec<&str> = qr.split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "2@abc");
        assert_eq!(fields[1], STANDARD.encode([1_u8; 32]));
        assert_eq!(fields[3], STANDARD.encode([3_u8; 32]));
    }
}
