use std::ops::{Deref, DerefMut};

use argon2::Config as Argon2Config;
use data_encoding::{BASE64, HEXLOWER};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{
    config::Config,
    error::{Error, Result},
    model::{auth::Identity, store::Storage},
};

pub type HmacSha256 = Hmac<Sha256>;

/// Voter IDs are auto-incrementing integers.
pub type VoterId = u32;

pub const MIN_NAME_LENGTH: usize = 3;
pub const MIN_PASSWORD_LENGTH: usize = 3;
pub const MIN_CITIZENSHIP_LENGTH: usize = 4;
/// Decoded size limit of the biometric reference image.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const IMAGE_PREFIXES: [&str; 3] = [
    "data:image/jpeg;base64,",
    "data:image/jpg;base64,",
    "data:image/png;base64,",
];

/// Accessibility flags that select an alternate input modality.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accessibility {
    /// Visual assistance: vote by speech.
    #[serde(default)]
    pub is_blind: bool,
    /// Physical assistance: vote by hand gesture.
    #[serde(default)]
    pub is_disabled: bool,
}

/// Core voter data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCore {
    pub name: String,
    pub email: String,
    /// Keyed digest of the national identifier; the raw number is never stored.
    pub citizenship_hmac: String,
    pub password_hash: String,
    pub admin: bool,
    pub verified: bool,
    #[serde(flatten)]
    pub accessibility: Accessibility,
    /// Base64 biometric reference image, without the data URL prefix.
    pub image: Option<String>,
}

impl VoterCore {
    /// Check whether the given password is correct.
    pub fn verify_password<T: AsRef<[u8]>>(&self, password: T) -> Result<bool> {
        Ok(argon2::verify_encoded(&self.password_hash, password.as_ref())?)
    }
}

/// A voter without an ID.
pub type NewVoter = VoterCore;

/// A voter from the credential store, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    #[serde(rename = "_id")]
    pub id: VoterId,
    #[serde(flatten)]
    pub voter: VoterCore,
}

impl Deref for Voter {
    type Target = VoterCore;

    fn deref(&self) -> &Self::Target {
        &self.voter
    }
}

impl DerefMut for Voter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voter
    }
}

impl From<&Voter> for Identity {
    fn from(voter: &Voter) -> Self {
        Self {
            id: voter.id,
            name: voter.name.clone(),
            email: voter.email.clone(),
            admin: voter.admin,
            is_blind: voter.accessibility.is_blind,
            is_disabled: voter.accessibility.is_disabled,
        }
    }
}

/// Hash a plaintext password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    // 16 bytes is recommended for password hashing:
    //  https://en.wikipedia.org/wiki/Argon2
    let mut salt = [0_u8; 16];
    rand::thread_rng().fill(&mut salt);
    Ok(argon2::hash_encoded(
        password.as_bytes(),
        &salt,
        &Argon2Config::default(),
    )?)
}

/// Digest a national identifier with the server's HMAC key.
pub fn citizenship_hmac(citizenship_number: &str, config: &Config) -> String {
    let mut hmac =
        HmacSha256::new_from_slice(config.hmac_secret()).expect("HMAC can take key of any size");
    hmac.update(citizenship_number.trim().as_bytes());
    HEXLOWER.encode(&hmac.finalize().into_bytes())
}

/// Credentials of the admin account created when none exists.
#[derive(Debug, Clone)]
pub struct AdminBootstrap {
    pub email: String,
    pub password: String,
}

/// Create the configured admin account unless an admin already exists.
pub async fn ensure_admin_exists(
    storage: &Storage,
    bootstrap: &AdminBootstrap,
    config: &Config,
) -> Result<()> {
    if storage.admin_exists().await? {
        debug!("Admin account already present");
        return Ok(());
    }
    let email = normalise_email(&bootstrap.email)?;
    let admin = NewVoter {
        name: "Administrator".to_string(),
        // Admins are not citizens of record; key the digest off the email instead.
        citizenship_hmac: citizenship_hmac(&format!("admin:{email}"), config),
        email,
        password_hash: hash_password(&bootstrap.password)?,
        admin: true,
        verified: true,
        accessibility: Accessibility::default(),
        image: None,
    };
    let admin = storage.insert_voter(admin).await?;
    warn!("Created bootstrap admin {} with ID {}", admin.email, admin.id);
    Ok(())
}

/// A registration request, received from a prospective voter.
/// The password is in plaintext, so this is never stored directly.
/// Missing fields read as empty and fail validation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    #[serde(rename = "citizenshipNumber")]
    pub citizenship_number: String,
    pub password: String,
    #[serde(flatten)]
    pub accessibility: Accessibility,
    pub image: String,
}

impl SignupRequest {
    /// Validate the request and convert it into a storable, unverified voter.
    pub fn into_voter(self, config: &Config) -> Result<NewVoter> {
        let name = self.name.trim();
        if name.chars().count() < MIN_NAME_LENGTH {
            return Err(Error::validation(
                "name",
                format!("must be at least {MIN_NAME_LENGTH} characters"),
            ));
        }
        let email = normalise_email(&self.email)?;
        if self.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(Error::validation(
                "password",
                format!("must be at least {MIN_PASSWORD_LENGTH} characters"),
            ));
        }
        if self.citizenship_number.trim().chars().count() < MIN_CITIZENSHIP_LENGTH {
            return Err(Error::validation(
                "citizenshipNumber",
                format!("must be at least {MIN_CITIZENSHIP_LENGTH} characters"),
            ));
        }
        let image = decode_image(&self.image)?;

        Ok(NewVoter {
            name: name.to_string(),
            email,
            citizenship_hmac: citizenship_hmac(&self.citizenship_number, config),
            password_hash: hash_password(&self.password)?,
            admin: false,
            verified: false,
            accessibility: self.accessibility,
            image: Some(image),
        })
    }
}

/// Check an email address has a plausible shape and lower-case it.
pub fn normalise_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split('.')
                    .filter(|part| !part.is_empty())
                    .count()
                    >= 2
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(Error::validation("email", "must be a valid email address"))
    }
}

/// Strip the data URL prefix from an image, check it decodes and is within
/// the size limit, and return the bare base64 payload.
fn decode_image(image: &str) -> Result<String> {
    let payload = IMAGE_PREFIXES
        .iter()
        .find_map(|prefix| image.strip_prefix(prefix))
        .ok_or_else(|| Error::validation("image", "Invalid image format"))?;
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|_| Error::validation("image", "Invalid image format"))?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(Error::validation("image", "Image size exceeds 5MB limit"));
    }
    Ok(payload.to_string())
}

/// Public view of a voter, as returned from registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSummary {
    pub id: VoterId,
    pub name: String,
    pub email: String,
    #[serde(flatten)]
    pub accessibility: Accessibility,
}

impl From<&Voter> for VoterSummary {
    fn from(voter: &Voter) -> Self {
        Self {
            id: voter.id,
            name: voter.name.clone(),
            email: voter.email.clone(),
            accessibility: voter.accessibility,
        }
    }
}

/// Account details, visible to the voter themselves and to admins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterDetails {
    pub id: VoterId,
    pub name: String,
    pub email: String,
    pub admin: bool,
    pub verified: bool,
    #[serde(flatten)]
    pub accessibility: Accessibility,
    pub has_image: bool,
}

impl From<&Voter> for VoterDetails {
    fn from(voter: &Voter) -> Self {
        Self {
            id: voter.id,
            name: voter.name.clone(),
            email: voter.email.clone(),
            admin: voter.admin,
            verified: voter.verified,
            accessibility: voter.accessibility,
            has_image: voter.image.is_some(),
        }
    }
}

/// Example data for tests.
#[cfg(test)]
pub(crate) mod examples {
    use super::*;

    /// A one-pixel PNG.
    pub const EXAMPLE_IMAGE: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    impl SignupRequest {
        pub fn example() -> Self {
            Self {
                name: "Liza Manandhar".into(),
                email: "liza@example.com".into(),
                citizenship_number: "9860777907".into(),
                password: "correct horse".into(),
                accessibility: Accessibility::default(),
                image: EXAMPLE_IMAGE.into(),
            }
        }
    }

    impl NewVoter {
        /// A verified voter with the given email, password `password123` and flags.
        pub fn example(email: &str, admin: bool, accessibility: Accessibility) -> Self {
            Self {
                name: email.split('@').next().unwrap_or("voter").to_string(),
                email: email.to_string(),
                citizenship_hmac: format!("digest-of-{email}"),
                password_hash: hash_password("password123").unwrap(),
                admin,
                verified: true,
                accessibility,
                image: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert_eq!(
            normalise_email(" John@Gmail.com ").unwrap(),
            "john@gmail.com"
        );
        for bad in ["", "john", "john@", "@gmail.com", "john@gmail", "jo hn@gmail.com", "a@b@c.com"] {
            assert!(normalise_email(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn image_prefix_and_size_are_checked() {
        assert!(decode_image(examples::EXAMPLE_IMAGE).is_ok());
        assert!(matches!(
            decode_image("data:image/gif;base64,R0lGODlh"),
            Err(Error::Validation { field: "image", .. })
        ));
        assert!(matches!(
            decode_image("data:image/png;base64,not base64!"),
            Err(Error::Validation { field: "image", .. })
        ));
        let huge = format!(
            "data:image/png;base64,{}",
            BASE64.encode(&vec![0_u8; MAX_IMAGE_BYTES + 1])
        );
        assert!(matches!(
            decode_image(&huge),
            Err(Error::Validation { field: "image", .. })
        ));
    }

    #[test]
    fn password_hash_round_trip() {
        let voter = NewVoter::example("ben@example.com", false, Accessibility::default());
        assert!(voter.verify_password("password123").unwrap());
        assert!(!voter.verify_password("password124").unwrap());
    }

    #[test]
    fn citizenship_digest_is_keyed_and_trimmed() {
        let config = Config::example();
        let digest = citizenship_hmac("9860777907", &config);
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, citizenship_hmac(" 9860777907 ", &config));
        assert_ne!(digest, citizenship_hmac("9860777908", &config));
        assert!(!digest.contains("9860777907"));
    }

    #[test]
    fn signup_request_validation() {
        let config = Config::example();
        let voter = SignupRequest::example().into_voter(&config).unwrap();
        assert!(!voter.verified);
        assert!(!voter.admin);
        assert_eq!(voter.email, "liza@example.com");
        assert!(voter.verify_password("correct horse").unwrap());

        let short_name = SignupRequest {
            name: " al ".into(),
            ..SignupRequest::example()
        };
        assert!(matches!(
            short_name.into_voter(&config),
            Err(Error::Validation { field: "name", .. })
        ));
        let short_citizenship = SignupRequest {
            citizenship_number: "123".into(),
            ..SignupRequest::example()
        };
        assert!(matches!(
            short_citizenship.into_voter(&config),
            Err(Error::Validation {
                field: "citizenshipNumber",
                ..
            })
        ));
    }

    #[backend_test]
    async fn bootstrap_admin_created_once(storage: Storage) {
        let config = Config::example();
        let bootstrap = AdminBootstrap {
            email: "Officer@Example.com".to_string(),
            password: "hunter22".to_string(),
        };
        ensure_admin_exists(&storage, &bootstrap, &config)
            .await
            .unwrap();
        ensure_admin_exists(&storage, &bootstrap, &config)
            .await
            .unwrap();

        let voters = storage.voters().await.unwrap();
        assert_eq!(voters.len(), 1);
        let admin = &voters[0];
        assert!(admin.admin && admin.verified);
        assert_eq!(admin.email, "officer@example.com");
        assert!(admin.verify_password("hunter22").unwrap());
    }
}
