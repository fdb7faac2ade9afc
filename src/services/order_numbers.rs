use chrono::Utc;
use rand::Rng;

/// Generates human-readable order numbers of the form `ORD-YYYYMMDD-XXXXXX`.
///
/// The date prefix keeps numbers monotonic-looking for support staff; the
/// random suffix avoids coordination between server instances. Global
/// uniqueness is enforced by the unique index on `orders.order_number`.
#[derive(Clone, Default)]
pub struct OrderNumberGenerator;

impl OrderNumberGenerator {
    const SUFFIX_LEN: usize = 6;
    const ALPHABET: &'static [u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self) -> String {
        let date = Utc::now().format("%Y%m%d");
        let mut rng = rand::thread_rng();
        let suffix: String = (0..Self::SUFFIX_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..Self::ALPHABET.len());
                Self::ALPHABET[idx] as char
            })
            .collect();
        format!("ORD-{}-{}", date, suffix)
    }
}
