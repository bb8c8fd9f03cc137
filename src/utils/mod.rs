/// Random identifier and password generation
use rand::seq::SliceRandom;
use rand::Rng;

const MIN_PASSWORD_LENGTH: usize = 8;

const ALPHABET_DIGITS: &str = "0123456789";
const ALPHABET_LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const ALPHABET_UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ALPHABET_SPECIAL: &str = "~@#$^&*()-=+]}[{|;:.>,</?";

/// Character classes selectable for [`generate_identifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alphabet(u8);

impl Alphabet {
    pub const DIGITS: Alphabet = Alphabet(0b0001);
    pub const LOWERCASE: Alphabet = Alphabet(0b0010);
    pub const UPPERCASE: Alphabet = Alphabet(0b0100);
    pub const SPECIAL: Alphabet = Alphabet(0b1000);
    pub const ALL: Alphabet = Alphabet(0b1111);

    fn contains(self, other: Alphabet) -> bool {
        self.0 & other.0 == other.0
    }

    fn charset(self) -> String {
        let mut result = String::new();
        if self.contains(Alphabet::DIGITS) {
            result.push_str(ALPHABET_DIGITS);
        }
        if self.contains(Alphabet::LOWERCASE) {
            result.push_str(ALPHABET_LOWERCASE);
        }
        if self.contains(Alphabet::UPPERCASE) {
            result.push_str(ALPHABET_UPPERCASE);
        }
        if self.contains(Alphabet::SPECIAL) {
            result.push_str(ALPHABET_SPECIAL);
        }
        result
    }
}

/// Generate a random string of `length` characters drawn from the given
/// character classes.
pub fn generate_identifier(length: usize, alphabet: Alphabet) -> String {
    let charset: Vec<char> = alphabet.charset().chars().collect();
    assert!(!charset.is_empty(), "empty alphabet mask");

    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| charset[rng.gen_range(0..charset.len())])
        .collect()
}

/// Generate a password of exactly `length` characters containing at least
/// one digit, one lowercase letter, one uppercase letter and one special
/// character. `length` must be at least 8.
pub fn generate_strong_password(length: usize) -> String {
    assert!(
        length >= MIN_PASSWORD_LENGTH,
        "password needs to be at least {MIN_PASSWORD_LENGTH} characters long"
    );

    let mut chars: Vec<char> = Vec::with_capacity(length);
    chars.extend(generate_identifier(1, Alphabet::DIGITS).chars());
    chars.extend(generate_identifier(1, Alphabet::LOWERCASE).chars());
    chars.extend(generate_identifier(1, Alphabet::UPPERCASE).chars());
    chars.extend(generate_identifier(1, Alphabet::SPECIAL).chars());
    chars.extend(generate_identifier(length - chars.len(), Alphabet::ALL).chars());

    chars.shuffle(&mut rand::thread_rng());
    chars.into_iter().collect()
}
