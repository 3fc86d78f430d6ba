// Gallery bucketing: split a wallet's NFTs into stage, backstage and junkbox
// according to its filter document.

use std::cmp::Ordering;

use solstage_client::nft::NftAsset;
use solstage_core::filter::{Bucket, FilterDocument};
use solstage_core::keys::Pubkey;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    pub stage: Vec<NftAsset>,
    pub backstage: Vec<NftAsset>,
    pub junkbox: Vec<NftAsset>,
    /// Assets without a collection; never displayed.
    pub hidden: usize,
    /// The viewer does not own the wallet and cannot move items.
    pub view_only: bool,
}

impl Gallery {
    pub fn bucket(&self, bucket: Bucket) -> &[NftAsset] {
        match bucket {
            Bucket::Stage => &self.stage,
            Bucket::Backstage => &self.backstage,
            Bucket::Junkbox => &self.junkbox,
        }
    }
}

fn floor_price(asset: &NftAsset) -> Option<f64> {
    asset.floor_price.as_ref().map(|f| f.price)
}

/// Priced assets first, most valuable first; unpriced keep their order.
pub fn sort_by_floor_price(assets: &mut [NftAsset]) {
    assets.sort_by(|a, b| match (floor_price(a), floor_price(b)) {
        (Some(pa), Some(pb)) => pb.partial_cmp(&pa).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Bucket `assets` by `document`. With no document everything grouped is
/// junk. `viewer` is the local wallet, if one is configured.
pub fn build(
    mut assets: Vec<NftAsset>,
    document: Option<&FilterDocument>,
    owner: &Pubkey,
    viewer: Option<&Pubkey>,
) -> Gallery {
    sort_by_floor_price(&mut assets);

    let empty = FilterDocument::empty();
    let document = document.unwrap_or(&empty);
    let stage = document.stage_set();
    let backstage = document.backstage_set();

    let mut gallery = Gallery {
        view_only: viewer != Some(owner),
        ..Gallery::default()
    };
    for asset in assets {
        if asset.group.is_none() {
            gallery.hidden += 1;
            continue;
        }
        let address = asset.address.as_str();
        if stage.contains(address) {
            gallery.stage.push(asset);
        } else if backstage.contains(address) {
            gallery.backstage.push(asset);
        } else {
            gallery.junkbox.push(asset);
        }
    }
    gallery
}

#[cfg(test)]
mod tests {
    use super::*;
    use solstage_client::nft::FloorPrice;
    use solstage_core::filter::address_key;

    fn asset(address: &str, group: Option<&str>, price: Option<f64>) -> NftAsset {
        NftAsset {
            address: address.into(),
            name: address.to_uppercase(),
            compressed: false,
            symbol: None,
            group: group.map(String::from),
            group_name: None,
            image_url: None,
            attributes: vec![],
            floor_price: price.map(|price| FloorPrice {
                currency: "USD".into(),
                price,
            }),
        }
    }

    fn addresses(assets: &[NftAsset]) -> Vec<&str> {
        assets.iter().map(|a| a.address.as_str()).collect()
    }

    #[test]
    fn sort_puts_priced_first_descending() {
        let mut assets = vec![
            asset("none1", Some("g"), None),
            asset("cheap", Some("g"), Some(1.0)),
            asset("none2", Some("g"), None),
            asset("pricey", Some("g"), Some(99.5)),
        ];
        sort_by_floor_price(&mut assets);
        assert_eq!(addresses(&assets), vec!["pricey", "cheap", "none1", "none2"]);
    }

    #[test]
    fn buckets_follow_document() {
        let doc = FilterDocument {
            stage: vec![address_key("s")],
            backstage: vec![address_key("b")],
            load_filters: vec![],
        };
        let owner = Pubkey::new([1u8; 32]);
        let gallery = build(
            vec![
                asset("j", Some("g"), Some(3.0)),
                asset("s", Some("g"), None),
                asset("b", Some("g"), Some(2.0)),
                asset("loose", None, Some(100.0)),
            ],
            Some(&doc),
            &owner,
            Some(&owner),
        );
        assert_eq!(addresses(gallery.bucket(Bucket::Stage)), vec!["s"]);
        assert_eq!(addresses(gallery.bucket(Bucket::Backstage)), vec!["b"]);
        assert_eq!(addresses(gallery.bucket(Bucket::Junkbox)), vec!["j"]);
        assert_eq!(gallery.hidden, 1);
        assert!(!gallery.view_only);
    }

    #[test]
    fn ungrouped_stage_entry_stays_hidden() {
        let doc = FilterDocument {
            stage: vec![address_key("x")],
            ..FilterDocument::empty()
        };
        let owner = Pubkey::new([1u8; 32]);
        let gallery = build(vec![asset("x", None, None)], Some(&doc), &owner, None);
        assert!(gallery.stage.is_empty());
        assert_eq!(gallery.hidden, 1);
    }

    #[test]
    fn no_document_means_everything_is_junk() {
        let owner = Pubkey::new([1u8; 32]);
        let gallery = build(
            vec![asset("a", Some("g"), None), asset("b", Some("g"), None)],
            None,
            &owner,
            Some(&owner),
        );
        assert_eq!(addresses(&gallery.junkbox), vec!["a", "b"]);
        assert!(gallery.stage.is_empty() && gallery.backstage.is_empty());
    }

    #[test]
    fn other_wallets_are_view_only() {
        let owner = Pubkey::new([1u8; 32]);
        let me = Pubkey::new([2u8; 32]);
        assert!(build(vec![], None, &owner, Some(&me)).view_only);
        assert!(build(vec![], None, &owner, None).view_only);
    }
}
