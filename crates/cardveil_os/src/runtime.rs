#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use cardveil_engines::fragment_seal::FragmentSealer;
use cardveil_kernel_contracts::allowance::AllowanceSnapshot;
use cardveil_kernel_contracts::billing::{OwnerBillingRecord, SettlementRecord};
use cardveil_kernel_contracts::card::{
    ProfileIndex, ProfilePermission, ProfilePermissionPatch, SplitCardRecord,
};
use cardveil_kernel_contracts::confirmation::CheckoutConfirmation;
use cardveil_kernel_contracts::ids::{BotId, CardId, CheckoutId, ConfirmationId, EventId, OwnerId};
use cardveil_kernel_contracts::obfuscation::{
    BotTask, ObfuscationEvent, PurchaseSpec, RealPurchaseRequest,
};
use cardveil_kernel_contracts::rail5::{KeyMaterial, Rail5Card, Rail5Checkout};
use cardveil_storage::CardVaultStore;
use chrono::{DateTime, Utc};

use crate::allowance::AllowanceLedger;
use crate::billing::BillingRuntime;
use crate::config::CardVaultConfig;
use crate::confirmation::{CheckoutRequest, ConfirmationRuntime, ConfirmationView};
use crate::custody::{
    owned_card, CardPermissions, CustodyRuntime, InitializeOutcome, OwnerDataInput,
};
use crate::decoy::{DecoyNeed, DecoyRuntime, TickOutcome};
use crate::error::CoreError;
use crate::escrow::{EscrowRuntime, NewRail5Card};
use crate::external::{OwnerIdentity, PaymentProcessor, WebhookSink};
use crate::keyed_lock::KeyedLocks;
use crate::rate_limit::RateLimiter;
use crate::tasks::TaskRuntime;
use crate::verification::{VerificationRuntime, VerifyRequest};

/// Result of one scheduler pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub outcomes: Vec<TickOutcome>,
    pub expired: usize,
}

/// Collaborators injected at construction.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub sealer: Arc<FragmentSealer>,
    pub webhooks: Arc<dyn WebhookSink>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub payments: Arc<dyn PaymentProcessor>,
}

/// Every card-vault operation behind one handle: the shared store, the per-area
/// runtimes, and the per-bot locks that order task hand-out against the tick.
pub struct CardVaultRuntime {
    config: CardVaultConfig,
    store: Arc<CardVaultStore>,
    locks: KeyedLocks<BotId>,
    rate_limiter: Arc<dyn RateLimiter>,
    billing: BillingRuntime,
    custody: CustodyRuntime,
    verification: VerificationRuntime,
    ledger: AllowanceLedger,
    confirmation: ConfirmationRuntime,
    escrow: EscrowRuntime,
    decoy: DecoyRuntime,
    tasks: TaskRuntime,
}

impl CardVaultRuntime {
    pub fn new(
        config: CardVaultConfig,
        store: Arc<CardVaultStore>,
        deps: RuntimeDeps,
    ) -> Result<Self, CoreError> {
        let decoy = DecoyRuntime::new(config.decoy);
        Ok(Self {
            custody: CustodyRuntime::new(&config, deps.sealer.clone(), deps.webhooks.clone())?,
            verification: VerificationRuntime::new(deps.sealer.clone()),
            ledger: AllowanceLedger,
            confirmation: ConfirmationRuntime::new(
                config.confirmation_ttl,
                deps.sealer,
                deps.webhooks.clone(),
            ),
            escrow: EscrowRuntime::new(config.rail5_approval_ttl, deps.webhooks),
            tasks: TaskRuntime::new(decoy.clone()),
            decoy,
            config,
            store,
            locks: KeyedLocks::new(),
            rate_limiter: deps.rate_limiter,
            billing: BillingRuntime::new(deps.payments),
        })
    }

    pub fn config(&self) -> &CardVaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CardVaultStore> {
        &self.store
    }

    /// Admission check for one call; keyed by caller id and endpoint name.
    pub fn admit(&self, caller: &str, endpoint: &'static str) -> Result<(), CoreError> {
        self.rate_limiter.check(caller, endpoint, Instant::now())
    }

    // ----- owner onboarding ----------------------------------------------------------

    pub fn register_owner_billing(
        &self,
        owner: &OwnerIdentity,
        payment_method_token: &str,
        now: DateTime<Utc>,
    ) -> Result<OwnerBillingRecord, CoreError> {
        self.billing
            .register(&self.store, owner, payment_method_token, now)
    }

    pub fn owner_billing(&self, owner_id: &OwnerId) -> Option<OwnerBillingRecord> {
        self.billing.registration(&self.store, owner_id)
    }

    /// The charge recorded for an approved confirmation or rail-5 checkout, if any.
    pub fn settlement(&self, subject_id: &str) -> Option<SettlementRecord> {
        self.billing.settlement(&self.store, subject_id)
    }

    // ----- split-knowledge custody ---------------------------------------------------

    pub fn initialize(
        &self,
        owner_id: &OwnerId,
        bot_id: Option<BotId>,
        now: DateTime<Utc>,
    ) -> Result<InitializeOutcome, CoreError> {
        self.custody.initialize(&self.store, owner_id, bot_id, now)
    }

    pub fn resolve_pending_card(
        &self,
        owner_id: &OwnerId,
        bot_id: &BotId,
    ) -> Result<CardId, CoreError> {
        self.custody.resolve_pending_card(&self.store, owner_id, bot_id)
    }

    pub fn submit_owner_data(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        input: OwnerDataInput,
        now: DateTime<Utc>,
    ) -> Result<SplitCardRecord, CoreError> {
        self.custody
            .submit_owner_data(&self.store, owner_id, card_id, input, now)
    }

    pub fn link_bot(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        bot_id: BotId,
        now: DateTime<Utc>,
    ) -> Result<SplitCardRecord, CoreError> {
        self.custody
            .link_bot(&self.store, owner_id, card_id, bot_id, now)
    }

    pub fn freeze(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        frozen: bool,
        now: DateTime<Utc>,
    ) -> Result<SplitCardRecord, CoreError> {
        self.custody
            .freeze(&self.store, owner_id, card_id, frozen, now)
    }

    pub fn permissions(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
    ) -> Result<CardPermissions, CoreError> {
        self.custody.permissions(&self.store, owner_id, card_id)
    }

    pub fn update_permission(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        profile_index: ProfileIndex,
        patch: &ProfilePermissionPatch,
        now: DateTime<Utc>,
    ) -> Result<ProfilePermission, CoreError> {
        self.custody
            .update_permission(&self.store, owner_id, card_id, profile_index, patch, now)
    }

    pub fn delete_card(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.custody.delete_card(&self.store, owner_id, card_id, now)
    }

    /// Allowance state of every profile on an owner's card.
    pub fn allowances(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        now: DateTime<Utc>,
    ) -> Result<Vec<AllowanceSnapshot>, CoreError> {
        owned_card(&self.store, owner_id, card_id)?;
        Ok(self.ledger.snapshots(&self.store, card_id, now))
    }

    // ----- bot-facing split-knowledge rail -------------------------------------------

    pub fn verify(&self, bot_id: &BotId, request: &VerifyRequest) -> Result<bool, CoreError> {
        self.verification.verify(&self.store, bot_id, request)
    }

    pub fn request_checkout(
        &self,
        bot_id: &BotId,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutConfirmation, CoreError> {
        let confirmation = self
            .confirmation
            .request_checkout(&self.store, bot_id, request, now)?;
        self.billing
            .settle_confirmation(&self.store, &confirmation, now);
        Ok(confirmation)
    }

    pub fn decide_checkout(
        &self,
        owner_id: &OwnerId,
        confirmation_id: &ConfirmationId,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<CheckoutConfirmation, CoreError> {
        let confirmation = self
            .confirmation
            .decide(&self.store, owner_id, confirmation_id, approve, now)?;
        self.billing
            .settle_confirmation(&self.store, &confirmation, now);
        Ok(confirmation)
    }

    pub fn checkout_status(
        &self,
        bot_id: &BotId,
        confirmation_id: &ConfirmationId,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationView, CoreError> {
        self.confirmation
            .status(&self.store, bot_id, confirmation_id, now)
    }

    // ----- key-escrow rail -----------------------------------------------------------

    pub fn rail5_create_card(
        &self,
        owner_id: &OwnerId,
        new_card: NewRail5Card,
        now: DateTime<Utc>,
    ) -> Result<Rail5Card, CoreError> {
        self.escrow.create_card(&self.store, owner_id, new_card, now)
    }

    pub fn rail5_submit_key_material(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        material: KeyMaterial,
        now: DateTime<Utc>,
    ) -> Result<Rail5Card, CoreError> {
        self.escrow
            .submit_key_material(&self.store, owner_id, card_id, material, now)
    }

    pub fn rail5_link_bot(
        &self,
        owner_id: &OwnerId,
        card_id: &CardId,
        bot_id: BotId,
        now: DateTime<Utc>,
    ) -> Result<Rail5Card, CoreError> {
        self.escrow
            .link_bot(&self.store, owner_id, card_id, bot_id, now)
    }

    pub fn rail5_request_checkout(
        &self,
        bot_id: &BotId,
        purchase: PurchaseSpec,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        let checkout = self
            .escrow
            .request_checkout(&self.store, bot_id, purchase, now)?;
        self.billing
            .settle_rail5_checkout(&self.store, &checkout, now);
        Ok(checkout)
    }

    pub fn rail5_decide(
        &self,
        owner_id: &OwnerId,
        checkout_id: &CheckoutId,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        let checkout = self
            .escrow
            .decide(&self.store, owner_id, checkout_id, approve, now)?;
        self.billing
            .settle_rail5_checkout(&self.store, &checkout, now);
        Ok(checkout)
    }

    pub fn rail5_status(
        &self,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        self.escrow.status(&self.store, bot_id, checkout_id, now)
    }

    pub fn rail5_deliver_key(
        &self,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        now: DateTime<Utc>,
    ) -> Result<KeyMaterial, CoreError> {
        self.escrow
            .deliver_key(&self.store, bot_id, checkout_id, now)
    }

    /// Key delivery that is withheld and reverted unless `persist` succeeds.
    pub fn rail5_deliver_key_durably(
        &self,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        now: DateTime<Utc>,
        persist: impl FnOnce() -> Result<(), String>,
    ) -> Result<KeyMaterial, CoreError> {
        self.escrow
            .deliver_key_durably(&self.store, bot_id, checkout_id, now, persist)
    }

    pub fn rail5_confirm(
        &self,
        bot_id: &BotId,
        checkout_id: &CheckoutId,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<Rail5Checkout, CoreError> {
        self.escrow
            .confirm(&self.store, bot_id, checkout_id, success, now)
    }

    // ----- obfuscation and tasks -----------------------------------------------------

    pub fn pending_events(&self, bot_id: &BotId) -> Vec<ObfuscationEvent> {
        self.decoy.pending_events(&self.store, bot_id)
    }

    pub fn obfuscation_need(&self, bot_id: &BotId, now: DateTime<Utc>) -> DecoyNeed {
        self.decoy.decide_obfuscation_need(&self.store, bot_id, now)
    }

    /// Creates a decoy directly, under the bot's lock.
    pub fn create_decoy_event(
        &self,
        bot_id: &BotId,
        profile_index: Option<ProfileIndex>,
        now: DateTime<Utc>,
    ) -> Result<ObfuscationEvent, CoreError> {
        self.locks.with_lock(bot_id, || {
            self.decoy
                .create_event(&self.store, bot_id, profile_index, now)
        })
    }

    pub fn queue_real_purchase(
        &self,
        owner_id: &OwnerId,
        bot_id: &BotId,
        purchase: PurchaseSpec,
        now: DateTime<Utc>,
    ) -> Result<RealPurchaseRequest, CoreError> {
        self.tasks
            .queue_real_purchase(&self.store, owner_id, bot_id, purchase, now)
    }

    pub fn next_task(
        &self,
        bot_id: &BotId,
        now: DateTime<Utc>,
    ) -> Result<Option<BotTask>, CoreError> {
        self.tasks.next_task(&self.store, &self.locks, bot_id, now)
    }

    pub fn complete_task(
        &self,
        bot_id: &BotId,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<ObfuscationEvent, CoreError> {
        self.tasks.complete_task(&self.store, bot_id, event_id, now)
    }

    /// Decoy scheduling for every active bot followed by an expiry sweep.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let outcomes = self
            .decoy
            .tick_all_active_bots(&self.store, &self.locks, now);
        let expired = self.confirmation.sweep_expired(&self.store, now);
        TickReport { outcomes, expired }
    }
}


#[cfg(test)]
mod split_knowledge_scenarios {
    use std::sync::Arc;

    use cardveil_engines::custody::synthesize_profile;
    use cardveil_engines::fragment_seal::FragmentSealer;
    use cardveil_engines::limits::LimitKind;
    use cardveil_kernel_contracts::card::{
        AllowanceDuration, CurrencyCode, FakeProfile, HumanPermissionPolicy, MissingDigitPositions,
        ProfileIndex, ProfilePermission, ProfilePermissionPatch, ProfileSlot, SplitCardRecord,
        SplitCardStatus,
    };
    use cardveil_kernel_contracts::confirmation::ConfirmationStatus;
    use cardveil_kernel_contracts::ids::{BotId, CardId, OwnerId};
    use cardveil_kernel_contracts::ReasonCodeId;
    use crate::confirmation::CheckoutRequest;
    use crate::custody::OwnerDataInput;
    use crate::external::{NoopPaymentProcessor, TracingWebhookSink};
    use crate::purchase::purchase_spec;
    use crate::rate_limit::UnlimitedRateLimiter;
    use crate::verification::VerifyRequest;
    use crate::{CardVaultConfig, CardVaultRuntime, CoreError, RuntimeDeps};
    use cardveil_storage::CardVaultStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const SEED_RC: ReasonCodeId = ReasonCodeId(0x5445_0001);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn owner() -> OwnerId {
        OwnerId::new("owner_scenario").unwrap()
    }

    fn bot() -> BotId {
        BotId::new("bot_scenario").unwrap()
    }

    fn runtime(sealer: Arc<FragmentSealer>) -> CardVaultRuntime {
        CardVaultRuntime::new(
            CardVaultConfig::mvp_v1(),
            Arc::new(CardVaultStore::new_in_memory()),
            RuntimeDeps {
                sealer,
                webhooks: Arc::new(TracingWebhookSink),
                rate_limiter: Arc::new(UnlimitedRateLimiter),
                payments: Arc::new(NoopPaymentProcessor),
            },
        )
        .unwrap()
    }

    /// Five profiles, blanks at [5, 11, 14], real profile 3. Returns the fakes.
    fn seed_fixed_card(rt: &CardVaultRuntime, sealer: &FragmentSealer, card_id: &CardId) -> Vec<FakeProfile> {
        let positions = MissingDigitPositions::new([5, 11, 14]).unwrap();
        let real = ProfileIndex::new(3).unwrap();
        let record = SplitCardRecord::v1(
            card_id.clone(),
            owner(),
            Some(bot()),
            5,
            real,
            positions,
            "a".repeat(64),
            now(),
        )
        .unwrap();
        let mut rng = rand::thread_rng();
        let mut fakes = Vec::new();
        let mut slots = Vec::new();
        for n in 1..=5u8 {
            let index = ProfileIndex::new(n).unwrap();
            let permission = ProfilePermission::v1(
                10_000,
                CurrencyCode::usd(),
                AllowanceDuration::Month,
                2_500,
                HumanPermissionPolicy::AboveExemptLimit,
            )
            .unwrap();
            if index == real {
                slots.push(ProfileSlot {
                    card_id: card_id.clone(),
                    profile_index: index,
                    holder_name: None,
                    holder_zip: None,
                    sealed_secret: None,
                    permission,
                });
                continue;
            }
            let fake = synthesize_profile(&mut rng, index, now()).unwrap();
            slots.push(ProfileSlot {
                card_id: card_id.clone(),
                profile_index: index,
                holder_name: Some(fake.holder_name.clone()),
                holder_zip: Some(fake.holder_zip.clone()),
                sealed_secret: Some(
                    sealer
                        .seal(&fake.card_number.fragment_at(&positions), fake.expiry)
                        .unwrap(),
                ),
                permission,
            });
            fakes.push(fake);
        }
        rt.store()
            .split_card_initialize_commit(record, slots, 3, SEED_RC)
            .unwrap();
        fakes
    }

    fn verify(
        rt: &CardVaultRuntime,
        card_id: &CardId,
        index: u8,
        digits: &str,
        month: u8,
        year: u16,
    ) -> Result<bool, CoreError> {
        rt.verify(
            &bot(),
            &VerifyRequest {
                card_id: card_id.clone(),
                profile_index: Some(ProfileIndex::new(index).unwrap()),
                missing_digits: digits.to_string(),
                expiry_month: month,
                expiry_year: year,
            },
        )
    }

    fn owner_data() -> OwnerDataInput {
        OwnerDataInput {
            missing_digits: "482".to_string(),
            expiry_month: 9,
            expiry_year: 2027,
            owner_name: "Dana Ortiz".to_string(),
            owner_zip: "94107".to_string(),
        }
    }

    #[test]
    fn at_scenario_split_01_real_profile_verifies_and_fakes_match_only_themselves() {
        let sealer = Arc::new(FragmentSealer::generate());
        let rt = runtime(sealer.clone());
        let card_id = CardId::new("card_scenario_fixed").unwrap();
        let fakes = seed_fixed_card(&rt, &sealer, &card_id);

        let card = rt
            .submit_owner_data(&owner(), &card_id, owner_data(), now())
            .unwrap();
        assert_eq!(card.status, SplitCardStatus::Active);
        assert_eq!(
            rt.submit_owner_data(&owner(), &card_id, owner_data(), now()),
            Err(CoreError::AlreadyActive)
        );

        assert_eq!(verify(&rt, &card_id, 3, "482", 9, 2027), Ok(true));
        assert_eq!(verify(&rt, &card_id, 3, "481", 9, 2027), Ok(false));
        assert_eq!(verify(&rt, &card_id, 3, "483", 9, 2027), Ok(false));
        assert_eq!(verify(&rt, &card_id, 3, "482", 8, 2027), Ok(false));
        assert_eq!(verify(&rt, &card_id, 3, "482", 9, 2028), Ok(false));

        let fake_one = fakes
            .iter()
            .find(|f| f.profile_index.get() == 1)
            .unwrap();
        let positions = MissingDigitPositions::new([5, 11, 14]).unwrap();
        let own = fake_one.card_number.fragment_at(&positions);
        assert_eq!(
            verify(
                &rt,
                &card_id,
                1,
                own.as_str(),
                fake_one.expiry.month,
                fake_one.expiry.year
            ),
            Ok(true)
        );
        let real_on_fake = own.as_str() == "482"
            && fake_one.expiry.month == 9
            && fake_one.expiry.year == 2027;
        assert_eq!(verify(&rt, &card_id, 1, "482", 9, 2027), Ok(real_on_fake));
    }

    #[test]
    fn at_scenario_split_02_artifact_blanks_the_same_positions_on_every_profile() {
        let rt = runtime(Arc::new(FragmentSealer::generate()));
        let out = rt.initialize(&owner(), Some(bot()), now()).unwrap();
        let number_lines: Vec<&str> = out
            .artifact_text
            .lines()
            .filter(|l| l.starts_with("number:"))
            .collect();
        assert_eq!(number_lines.len(), usize::from(out.profile_count));
        for line in number_lines {
            let digits: Vec<char> = line
                .trim_start_matches("number:")
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            assert_eq!(digits.len(), 16);
            for (pos, c) in digits.iter().enumerate() {
                assert_eq!(
                    *c == 'X',
                    out.missing_digit_positions.contains(pos),
                    "position {pos} in {line}"
                );
            }
        }
        // A second initialize for the same bot while pending replaces the card.
        let again = rt.initialize(&owner(), Some(bot()), now()).unwrap();
        assert_ne!(again.card_id, out.card_id);
        assert!(rt.store().split_card_get(&out.card_id).is_none());
    }

    #[test]
    fn at_scenario_split_03_allowance_exhausts_then_resets_next_day() {
        let sealer = Arc::new(FragmentSealer::generate());
        let rt = runtime(sealer.clone());
        let card_id = CardId::new("card_scenario_allow").unwrap();
        seed_fixed_card(&rt, &sealer, &card_id);
        rt.submit_owner_data(&owner(), &card_id, owner_data(), now())
            .unwrap();
        let real = ProfileIndex::new(3).unwrap();
        rt.update_permission(
            &owner(),
            &card_id,
            real,
            &ProfilePermissionPatch {
                allowance_value_cents: Some(5_000),
                allowance_duration: Some(AllowanceDuration::Day),
                human_permission_required: Some(HumanPermissionPolicy::None),
                ..ProfilePermissionPatch::default()
            },
            now(),
        )
        .unwrap();

        let checkout = |amount: u64, at: DateTime<Utc>| {
            rt.request_checkout(
                &bot(),
                CheckoutRequest {
                    card_id: card_id.clone(),
                    profile_index: real,
                    purchase: purchase_spec("Corner Books", "https://books.example", "Atlas", amount)
                        .unwrap(),
                },
                at,
            )
        };
        let approved = checkout(5_000, now()).unwrap();
        assert_eq!(approved.status, ConfirmationStatus::Approved);
        let allowances = rt.allowances(&owner(), &card_id, now()).unwrap();
        let snap = allowances
            .iter()
            .find(|s| s.profile_index == real)
            .unwrap();
        assert_eq!(snap.remaining_cents, 0);
        assert_eq!(
            checkout(1, now() + Duration::hours(2)),
            Err(CoreError::LimitExceeded {
                limit: LimitKind::Allowance,
                remaining_cents: 0
            })
        );
        let tomorrow = Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 1).unwrap();
        assert_eq!(
            checkout(5_000, tomorrow).unwrap().status,
            ConfirmationStatus::Approved
        );

        let view = rt
            .checkout_status(&bot(), &approved.confirmation_id, now())
            .unwrap();
        let data = view.card_data.unwrap();
        assert_eq!(data.missing_digits.as_str(), "482");
        assert_eq!(data.holder_name, "Dana Ortiz");
    }

    #[test]
    fn at_scenario_split_04_frozen_card_fails_verification_and_checkout() {
        let sealer = Arc::new(FragmentSealer::generate());
        let rt = runtime(sealer.clone());
        let card_id = CardId::new("card_scenario_frozen").unwrap();
        seed_fixed_card(&rt, &sealer, &card_id);
        rt.submit_owner_data(&owner(), &card_id, owner_data(), now())
            .unwrap();
        rt.freeze(&owner(), &card_id, true, now()).unwrap();
        assert!(matches!(
            verify(&rt, &card_id, 3, "482", 9, 2027),
            Err(CoreError::InvalidState { .. })
        ));
        assert_eq!(rt.obfuscation_need(&bot(), now()).count, 0);
        rt.freeze(&owner(), &card_id, false, now()).unwrap();
        assert_eq!(verify(&rt, &card_id, 3, "482", 9, 2027), Ok(true));
    }

    #[test]
    fn at_scenario_split_05_initialize_cannot_exceed_per_bot_card_cap() {
        let rt = runtime(Arc::new(FragmentSealer::generate()));
        let cap = rt.config().max_cards_per_bot;
        for n in 0..cap {
            let owner_n = OwnerId::new(format!("owner_cap_{n}")).unwrap();
            rt.initialize(&owner_n, Some(bot()), now()).unwrap();
        }
        let late = OwnerId::new("owner_cap_late").unwrap();
        assert!(matches!(
            rt.initialize(&late, Some(bot()), now()),
            Err(CoreError::InvalidState { .. })
        ));
        assert_eq!(rt.store().split_cards_for_bot(&bot()).len(), cap);
        // A card without a bot is not counted against any bot.
        assert!(rt.initialize(&late, None, now()).is_ok());
    }
}
