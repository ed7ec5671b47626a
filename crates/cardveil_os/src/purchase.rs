#![forbid(unsafe_code)]

use cardveil_kernel_contracts::obfuscation::{MerchantDescriptor, PurchaseSpec};

use crate::error::CoreError;

/// Builds a validated purchase from caller-supplied parts. The merchant slug is
/// derived from the name.
pub fn purchase_spec(
    merchant_name: &str,
    merchant_url: &str,
    item_name: &str,
    amount_cents: u64,
) -> Result<PurchaseSpec, CoreError> {
    let merchant = MerchantDescriptor::v1(
        merchant_name.trim().to_string(),
        merchant_slug(merchant_name),
        merchant_url.trim().to_string(),
    )?;
    Ok(PurchaseSpec::v1(
        merchant,
        item_name.trim().to_string(),
        amount_cents,
    )?)
}

fn merchant_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("merchant");
    }
    slug.truncate(64);
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_purchase_01_slug_is_derived_and_fields_validated() {
        let spec = purchase_spec("Blue Bottle Coffee", "https://bluebottle.example", "Beans", 1_899)
            .unwrap();
        assert_eq!(spec.merchant.slug, "blue-bottle-coffee");
        assert!(matches!(
            purchase_spec("Shop", "http://insecure.example", "Thing", 100),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            purchase_spec("Shop", "https://shop.example", "Thing", 0),
            Err(CoreError::Validation(_))
        ));
    }
}
