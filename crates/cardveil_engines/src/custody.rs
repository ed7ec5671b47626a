#![forbid(unsafe_code)]

use std::fmt::Write as _;

use cardveil_kernel_contracts::card::{
    AllowanceDuration, CardExpiry, CardNumber, CurrencyCode, FakeProfile, HumanPermissionPolicy,
    MissingDigitPositions, ProfileIndex, ProfilePermission, CARD_NUMBER_LEN, MAX_PROFILE_COUNT,
    MIN_PROFILE_COUNT, MISSING_DIGIT_COUNT,
};
use cardveil_kernel_contracts::ContractViolation;
use chrono::{DateTime, Datelike, Utc};
use rand::seq::{index, SliceRandom};
use rand::Rng;
use sha2::{Digest, Sha256};

const FIRST_NAMES: &[&str] = &[
    "Avery", "Jordan", "Morgan", "Riley", "Casey", "Taylor", "Quinn", "Harper", "Rowan",
    "Emerson", "Dakota", "Reese", "Parker", "Hayden", "Cameron", "Skyler", "Logan", "Jamie",
    "Alexis", "Drew", "Elliot", "Finley", "Kendall", "Sawyer",
];

const LAST_NAMES: &[&str] = &[
    "Whitaker", "Delgado", "Okafor", "Lindqvist", "Nakamura", "Brennan", "Castillo", "Hughes",
    "Patel", "Moreau", "Sullivan", "Novak", "Ferreira", "Kowalski", "Adeyemi", "Barrett",
    "Chen", "Dawson", "Ellison", "Gallagher", "Holloway", "Iverson", "Jansen", "Keller",
];

// Network prefixes that produce plausible 16 digit numbers.
const NUMBER_PREFIXES: &[&str] = &[
    "4", "4", "4", "51", "52", "53", "54", "55", "2221", "2720", "6011",
];

const ZIP_PREFIXES: &[&str] = &[
    "021", "100", "191", "303", "331", "441", "606", "752", "802", "850", "941", "981",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustodyConfig {
    pub profile_count: u8,
    pub default_allowance_cents: u64,
    pub default_exempt_limit_cents: u64,
}

impl CustodyConfig {
    pub fn mvp_v1() -> Self {
        Self {
            profile_count: 5,
            default_allowance_cents: 10_000,
            default_exempt_limit_cents: 2_500,
        }
    }
}

/// Rendered split-knowledge worksheet handed to the owner once at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoyArtifact {
    pub text: String,
    pub digest_hex: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedCustody {
    pub missing_digit_positions: MissingDigitPositions,
    pub real_profile_index: ProfileIndex,
    pub fake_profiles: Vec<FakeProfile>,
    pub permissions: Vec<(ProfileIndex, ProfilePermission)>,
    pub artifact: DecoyArtifact,
}

#[derive(Debug, Clone)]
pub struct CustodyGenerator {
    config: CustodyConfig,
}

impl CustodyGenerator {
    pub fn new(config: CustodyConfig) -> Result<Self, ContractViolation> {
        if !(MIN_PROFILE_COUNT..=MAX_PROFILE_COUNT).contains(&config.profile_count) {
            return Err(ContractViolation::InvalidRange {
                field: "custody_config.profile_count",
                min: i64::from(MIN_PROFILE_COUNT),
                max: i64::from(MAX_PROFILE_COUNT),
                got: i64::from(config.profile_count),
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CustodyConfig {
        &self.config
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Result<GeneratedCustody, ContractViolation> {
        let missing_digit_positions = random_missing_positions(rng)?;
        let real_profile_index = ProfileIndex::new(rng.gen_range(1..=self.config.profile_count))?;

        let mut fake_profiles = Vec::with_capacity(usize::from(self.config.profile_count) - 1);
        let mut permissions = Vec::with_capacity(usize::from(self.config.profile_count));
        for raw in 1..=self.config.profile_count {
            let profile_index = ProfileIndex::new(raw)?;
            if profile_index != real_profile_index {
                fake_profiles.push(synthesize_profile(rng, profile_index, now)?);
            }
            permissions.push((profile_index, self.drawn_permission(rng)?));
        }

        let artifact = render_artifact(
            self.config.profile_count,
            real_profile_index,
            &missing_digit_positions,
            &fake_profiles,
        );

        Ok(GeneratedCustody {
            missing_digit_positions,
            real_profile_index,
            fake_profiles,
            permissions,
            artifact,
        })
    }

    /// Draws one profile's permission. The real profile and every synthetic one share
    /// this distribution, so no column of the permission table singles out the real row.
    pub fn drawn_permission<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<ProfilePermission, ContractViolation> {
        let base_allowance = self.config.default_allowance_cents;
        let base_exempt = self.config.default_exempt_limit_cents;
        let durations = [
            AllowanceDuration::Day,
            AllowanceDuration::Week,
            AllowanceDuration::Month,
            AllowanceDuration::Month,
        ];
        let policies = [
            HumanPermissionPolicy::None,
            HumanPermissionPolicy::AboveExemptLimit,
            HumanPermissionPolicy::AboveExemptLimit,
            HumanPermissionPolicy::All,
        ];
        // Scale factors in quarters of the configured default.
        let allowance = [2u64, 3, 4, 6, 8, 10]
            .choose(rng)
            .map_or(base_allowance, |q| base_allowance.saturating_mul(*q) / 4)
            .max(1);
        let exempt = [2u64, 3, 4, 5, 10]
            .choose(rng)
            .map_or(base_exempt, |fifths| base_exempt.saturating_mul(*fifths) / 5)
            .min(allowance);
        ProfilePermission::v1(
            allowance,
            CurrencyCode::usd(),
            *durations.choose(rng).unwrap_or(&AllowanceDuration::Month),
            exempt,
            *policies
                .choose(rng)
                .unwrap_or(&HumanPermissionPolicy::AboveExemptLimit),
        )
    }
}

fn random_missing_positions<R: Rng + ?Sized>(
    rng: &mut R,
) -> Result<MissingDigitPositions, ContractViolation> {
    let picked = index::sample(rng, CARD_NUMBER_LEN, MISSING_DIGIT_COUNT);
    let mut positions = [0u8; MISSING_DIGIT_COUNT];
    for (slot, p) in positions.iter_mut().zip(picked.iter()) {
        *slot = p as u8;
    }
    MissingDigitPositions::new(positions)
}

pub fn synthesize_profile<R: Rng + ?Sized>(
    rng: &mut R,
    profile_index: ProfileIndex,
    now: DateTime<Utc>,
) -> Result<FakeProfile, ContractViolation> {
    let first = FIRST_NAMES.choose(rng).copied().unwrap_or("Jordan");
    let last = LAST_NAMES.choose(rng).copied().unwrap_or("Hughes");
    let zip_prefix = ZIP_PREFIXES.choose(rng).copied().unwrap_or("100");
    let holder_zip = format!("{zip_prefix}{:02}", rng.gen_range(0..100));
    let year_offset: u16 = rng.gen_range(1..=5);
    let this_year = u16::try_from(now.year()).unwrap_or(2026);
    let expiry = CardExpiry::v1(rng.gen_range(1..=12), this_year.saturating_add(year_offset))?;
    Ok(FakeProfile {
        profile_index,
        card_number: synthesize_card_number(rng)?,
        holder_name: format!("{first} {last}"),
        holder_zip,
        expiry,
    })
}

pub fn synthesize_card_number<R: Rng + ?Sized>(rng: &mut R) -> Result<CardNumber, ContractViolation> {
    let prefix = NUMBER_PREFIXES.choose(rng).copied().unwrap_or("4");
    let mut digits = String::with_capacity(CARD_NUMBER_LEN);
    digits.push_str(prefix);
    while digits.len() < CARD_NUMBER_LEN - 1 {
        digits.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    digits.push(luhn_check_digit(&digits));
    CardNumber::new(digits)
}

fn luhn_check_digit(partial: &str) -> char {
    // Doubling starts at the rightmost digit of the partial number because the check
    // digit will be appended after it.
    let sum: u32 = partial
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    let check = (10 - (sum % 10)) % 10;
    char::from(b'0' + check as u8)
}

pub fn luhn_valid(number: &str) -> bool {
    if number.len() < 2 || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let (body, check) = number.split_at(number.len() - 1);
    check.chars().next() == Some(luhn_check_digit(body))
}

const BLANK: char = '_';
const MISSING: char = 'X';

fn render_number_line(
    positions: &MissingDigitPositions,
    number: Option<&CardNumber>,
) -> String {
    let digits = number.map(|n| n.as_str().as_bytes());
    let mut out = String::with_capacity(CARD_NUMBER_LEN + 3);
    for pos in 0..CARD_NUMBER_LEN {
        if pos > 0 && pos % 4 == 0 {
            out.push(' ');
        }
        if positions.contains(pos) {
            out.push(MISSING);
            continue;
        }
        match digits {
            Some(d) => out.push(char::from(d[pos])),
            None => out.push(BLANK),
        }
    }
    out
}

/// Renders the worksheet. Every profile, including the real one, has its blank digits
/// printed as `X`; the real slot additionally leaves its other fields for the owner.
pub fn render_artifact(
    profile_count: u8,
    real_profile_index: ProfileIndex,
    positions: &MissingDigitPositions,
    fake_profiles: &[FakeProfile],
) -> DecoyArtifact {
    let mut text = String::new();
    let _ = writeln!(text, "CARD PROFILE WORKSHEET v1");
    let _ = writeln!(text, "profiles: {profile_count}");
    let _ = writeln!(text);
    for raw in 1..=profile_count {
        let fake = fake_profiles
            .iter()
            .find(|p| p.profile_index.get() == raw && raw != real_profile_index.get());
        let _ = writeln!(text, "[profile {raw}]");
        match fake {
            Some(p) => {
                let _ = writeln!(text, "name:   {}", p.holder_name);
                let _ = writeln!(
                    text,
                    "number: {}",
                    render_number_line(positions, Some(&p.card_number))
                );
                let _ = writeln!(text, "expiry: {:02}/{:04}", p.expiry.month, p.expiry.year);
                let _ = writeln!(text, "zip:    {}", p.holder_zip);
            }
            None => {
                let _ = writeln!(text, "name:   ____________________");
                let _ = writeln!(text, "number: {}", render_number_line(positions, None));
                let _ = writeln!(text, "expiry: __/____");
                let _ = writeln!(text, "zip:    _____");
            }
        }
        let _ = writeln!(text);
    }
    let digest_hex = sha256_hex(text.as_bytes());
    DecoyArtifact { text, digest_hex }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}
