#![forbid(unsafe_code)]

use cardveil_kernel_contracts::card::ProfileIndex;
use cardveil_kernel_contracts::ids::CardId;
use cardveil_kernel_contracts::obfuscation::{MerchantDescriptor, PurchaseSpec};
use cardveil_kernel_contracts::ContractViolation;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Tunable cadence for camouflage traffic. The numbers are a policy, not a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoyPolicy {
    pub trailing_window_days: u32,
    pub decoys_per_real: u32,
    pub idle_cadence_days: u32,
    pub max_events_per_tick: u32,
}

impl DecoyPolicy {
    pub fn mvp_v1() -> Self {
        Self {
            trailing_window_days: 30,
            decoys_per_real: 2,
            idle_cadence_days: 3,
            max_events_per_tick: 1,
        }
    }

    pub fn trailing_window(&self) -> Duration {
        Duration::days(i64::from(self.trailing_window_days))
    }
}

/// What the scheduler knows about one bot's recent activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoyHistory {
    pub real_purchases_in_window: u32,
    pub decoy_events_in_window: u32,
    pub pending_event: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Number of decoy events to manufacture now. Never positive while an event is
/// pending and never above `max_events_per_tick`.
pub fn decide_need(policy: &DecoyPolicy, history: &DecoyHistory, now: DateTime<Utc>) -> u32 {
    if history.pending_event || policy.max_events_per_tick == 0 {
        return 0;
    }
    let target = history
        .real_purchases_in_window
        .saturating_mul(policy.decoys_per_real);
    let deficit = target.saturating_sub(history.decoy_events_in_window);
    let idle_due = match history.last_activity_at {
        None => 1,
        Some(last) if now - last >= Duration::days(i64::from(policy.idle_cadence_days)) => 1,
        Some(_) => 0,
    };
    deficit.max(idle_due).min(policy.max_events_per_tick)
}

struct CatalogItem {
    name: &'static str,
    min_cents: u64,
    max_cents: u64,
}

struct CatalogMerchant {
    name: &'static str,
    slug: &'static str,
    url: &'static str,
    items: &'static [CatalogItem],
}

struct CatalogCategory {
    merchants: &'static [CatalogMerchant],
}

const fn item(name: &'static str, min_cents: u64, max_cents: u64) -> CatalogItem {
    CatalogItem {
        name,
        min_cents,
        max_cents,
    }
}

const CATALOG: &[CatalogCategory] = &[
    CatalogCategory {
        merchants: &[
            CatalogMerchant {
                name: "Paper Trail Books",
                slug: "paper-trail-books",
                url: "https://papertrailbooks.example",
                items: &[
                    item("Paperback novel", 899, 1_899),
                    item("Hardcover cookbook", 2_199, 3_999),
                    item("Weekly planner", 1_299, 2_499),
                ],
            },
            CatalogMerchant {
                name: "Inkwell Stationers",
                slug: "inkwell-stationers",
                url: "https://inkwell.example",
                items: &[
                    item("Gel pen set", 599, 1_499),
                    item("Dot grid notebook", 999, 2_199),
                ],
            },
        ],
    },
    CatalogCategory {
        merchants: &[
            CatalogMerchant {
                name: "Greenleaf Grocers",
                slug: "greenleaf-grocers",
                url: "https://greenleafgrocers.example",
                items: &[
                    item("Pantry restock bundle", 2_499, 6_999),
                    item("Coffee beans 1kg", 1_599, 3_299),
                    item("Snack box", 999, 2_499),
                ],
            },
            CatalogMerchant {
                name: "Harbor Tea Co",
                slug: "harbor-tea",
                url: "https://harbortea.example",
                items: &[
                    item("Loose leaf sampler", 1_499, 2_999),
                    item("Ceramic teapot", 2_499, 4_999),
                ],
            },
        ],
    },
    CatalogCategory {
        merchants: &[
            CatalogMerchant {
                name: "Circuit Supply",
                slug: "circuit-supply",
                url: "https://circuitsupply.example",
                items: &[
                    item("USB-C cable 2m", 899, 1_999),
                    item("Wireless mouse", 1_999, 4_499),
                    item("Laptop stand", 2_999, 5_999),
                ],
            },
            CatalogMerchant {
                name: "Byte Cloud Hosting",
                slug: "byte-cloud",
                url: "https://bytecloud.example",
                items: &[
                    item("Monthly VPS plan", 500, 2_000),
                    item("Domain renewal", 1_099, 1_999),
                ],
            },
        ],
    },
    CatalogCategory {
        merchants: &[
            CatalogMerchant {
                name: "Corner Hardware",
                slug: "corner-hardware",
                url: "https://cornerhardware.example",
                items: &[
                    item("Hex key set", 799, 1_999),
                    item("LED bulb 4-pack", 1_299, 2_499),
                    item("Cordless drill bits", 1_499, 3_499),
                ],
            },
            CatalogMerchant {
                name: "Sprout & Stem Garden",
                slug: "sprout-and-stem",
                url: "https://sproutandstem.example",
                items: &[
                    item("Herb seed kit", 999, 2_299),
                    item("Potting soil 20L", 1_199, 2_199),
                ],
            },
        ],
    },
    CatalogCategory {
        merchants: &[
            CatalogMerchant {
                name: "Streamline Media",
                slug: "streamline-media",
                url: "https://streamlinemedia.example",
                items: &[
                    item("Streaming subscription", 799, 1_999),
                    item("Film rental", 399, 699),
                ],
            },
            CatalogMerchant {
                name: "Pixel Arcade",
                slug: "pixel-arcade",
                url: "https://pixelarcade.example",
                items: &[
                    item("Indie game download", 999, 2_999),
                    item("In-game credit pack", 499, 1_999),
                ],
            },
        ],
    },
    CatalogCategory {
        merchants: &[
            CatalogMerchant {
                name: "Trailhead Outfitters",
                slug: "trailhead-outfitters",
                url: "https://trailhead.example",
                items: &[
                    item("Water bottle", 1_499, 3_499),
                    item("Merino socks", 1_599, 2_799),
                    item("Headlamp", 1_999, 4_499),
                ],
            },
            CatalogMerchant {
                name: "Daily Grind Fitness",
                slug: "daily-grind-fitness",
                url: "https://dailygrind.example",
                items: &[
                    item("Resistance bands", 1_299, 2_999),
                    item("Yoga mat", 1_999, 4_999),
                ],
            },
        ],
    },
];

const AFFINITY_SIZE: usize = 3;

/// Stable shopping persona for one profile: the catalog categories it buys from.
pub fn profile_affinity(card_id: &CardId, profile_index: ProfileIndex) -> Vec<usize> {
    let mut hasher = Sha256::new();
    hasher.update(card_id.as_str().as_bytes());
    hasher.update([0u8, profile_index.get()]);
    let digest = hasher.finalize();
    let mut picked: Vec<usize> = Vec::with_capacity(AFFINITY_SIZE);
    for byte in digest.iter() {
        let category = usize::from(*byte) % CATALOG.len();
        if !picked.contains(&category) {
            picked.push(category);
        }
        if picked.len() == AFFINITY_SIZE {
            break;
        }
    }
    picked
}

/// Draws a plausible purchase for a profile, bounded by the profile's remaining
/// allowance. `None` when nothing in the persona fits under `max_amount_cents`.
pub fn synthesize_purchase<R: Rng + ?Sized>(
    rng: &mut R,
    card_id: &CardId,
    profile_index: ProfileIndex,
    max_amount_cents: u64,
) -> Result<Option<PurchaseSpec>, ContractViolation> {
    let affinity = profile_affinity(card_id, profile_index);
    let mut candidates: Vec<(&CatalogMerchant, &CatalogItem)> = affinity
        .iter()
        .filter_map(|c| CATALOG.get(*c))
        .flat_map(|c| c.merchants.iter())
        .flat_map(|m| m.items.iter().map(move |i| (m, i)))
        .filter(|(_, i)| i.min_cents <= max_amount_cents)
        .collect();
    candidates.shuffle(rng);
    let Some((merchant, item)) = candidates.first() else {
        return Ok(None);
    };
    let upper = item.max_cents.min(max_amount_cents);
    let raw = rng.gen_range(item.min_cents..=upper);
    // Prices end in 99 like shelf prices, unless that would leave the allowed range.
    let priced = (raw / 100) * 100 + 99;
    let amount_cents = if priced <= upper && priced >= item.min_cents {
        priced
    } else {
        raw
    };
    let merchant = MerchantDescriptor::v1(
        merchant.name.to_string(),
        merchant.slug.to_string(),
        merchant.url.to_string(),
    )?;
    Ok(Some(PurchaseSpec::v1(
        merchant,
        item.name.to_string(),
        amount_cents,
    )?))
}
