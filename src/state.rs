//! Local peer state guarded by a single lock.
//!
//! Inventory, the remote offer catalog and the reservation ledger all live in
//! one [`LocalState`] behind one `parking_lot::Mutex`. Every transition that
//! touches more than one of them is a single method on `LocalState`, so a
//! caller holding the guard sees either the state before or after it.

use crate::error::{Result, TradeError};
use crate::model::{AccountNumber, Good, OfferBroadcast, PeerOffer, Reservation, Route, SaleRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type SharedState = Arc<Mutex<LocalState>>;

/// Goods the local peer currently offers, by name.
#[derive(Debug, Default)]
pub struct InventoryStore {
    goods: HashMap<String, Good>,
}

impl InventoryStore {
    pub fn new(goods: impl IntoIterator<Item = Good>) -> Self {
        Self {
            goods: goods.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.goods.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Good> {
        self.goods.get(name)
    }

    /// Adds a good, refusing to shadow one already offered under that name.
    pub fn insert(&mut self, good: Good) -> bool {
        if self.goods.contains_key(&good.name) {
            return false;
        }
        self.goods.insert(good.name.clone(), good);
        true
    }

    pub fn take(&mut self, name: &str) -> Option<Good> {
        self.goods.remove(name)
    }

    /// Copy of the offered goods, ordered by name.
    pub fn snapshot(&self) -> Vec<Good> {
        let mut goods: Vec<Good> = self.goods.values().cloned().collect();
        goods.sort_by(|a, b| a.name.cmp(&b.name));
        goods
    }

    pub fn len(&self) -> usize {
        self.goods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goods.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogUpdate {
    IgnoredOwn,
    Replaced,
    Removed,
    Unchanged,
}

/// Cached, possibly stale view of the goods other peers offer.
#[derive(Debug, Default)]
pub struct OfferCatalog {
    own_identity: String,
    offers: HashMap<String, PeerOffer>,
}

impl OfferCatalog {
    pub fn new(own_identity: impl Into<String>) -> Self {
        Self {
            own_identity: own_identity.into(),
            offers: HashMap::new(),
        }
    }

    /// Applies a broadcast. Last writer wins: there is no sequencing, so a
    /// late delivery of an older snapshot replaces a newer one.
    pub fn apply(&mut self, broadcast: OfferBroadcast) -> CatalogUpdate {
        if broadcast.peer == self.own_identity {
            return CatalogUpdate::IgnoredOwn;
        }

        if broadcast.goods.is_empty() {
            return match self.offers.remove(&broadcast.peer) {
                Some(_) => CatalogUpdate::Removed,
                None => CatalogUpdate::Unchanged,
            };
        }

        self.offers.insert(
            broadcast.peer.clone(),
            PeerOffer {
                peer: broadcast.peer,
                goods: broadcast.goods,
            },
        );
        CatalogUpdate::Replaced
    }

    pub fn get(&self, peer: &str) -> Option<&PeerOffer> {
        self.offers.get(peer)
    }

    /// Listed prices for `goods` at `seller`; `None` when the seller is unknown.
    pub fn prices_of(&self, seller: &str, goods: &str) -> Option<Vec<u64>> {
        self.offers.get(seller).map(|offer| offer.prices_of(goods))
    }

    /// Offers ordered by peer identity.
    pub fn offers(&self) -> Vec<PeerOffer> {
        let mut offers: Vec<PeerOffer> = self.offers.values().cloned().collect();
        offers.sort_by(|a, b| a.peer.cmp(&b.peer));
        offers
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// Goods withdrawn from sale pending payment, with the buyer bindings needed
/// to settle them.
#[derive(Debug, Default)]
pub struct ReservationLedger {
    by_buyer: HashMap<String, Reservation>,
    buyer_by_account: HashMap<AccountNumber, String>,
    route_by_buyer: HashMap<String, Route>,
}

impl ReservationLedger {
    pub fn has_pending(&self, buyer: &str) -> bool {
        self.by_buyer.contains_key(buyer)
    }

    /// Records a reservation under all three indices. A buyer holds at most
    /// one pending reservation; a second one is handed back.
    pub fn insert(&mut self, reservation: Reservation) -> std::result::Result<(), Reservation> {
        if self.by_buyer.contains_key(&reservation.buyer)
            || self.buyer_by_account.contains_key(&reservation.buyer_account)
        {
            return Err(reservation);
        }

        self.buyer_by_account
            .insert(reservation.buyer_account, reservation.buyer.clone());
        self.route_by_buyer
            .insert(reservation.buyer.clone(), reservation.reply_route.clone());
        self.by_buyer.insert(reservation.buyer.clone(), reservation);
        Ok(())
    }

    pub fn find_by_account(&self, account: AccountNumber) -> Result<&Reservation> {
        let buyer = self
            .buyer_by_account
            .get(&account)
            .ok_or(TradeError::UnknownAccount(account))?;
        self.by_buyer
            .get(buyer)
            .ok_or(TradeError::ReservationNotFound(account))
    }

    pub fn reply_route(&self, buyer: &str) -> Option<&Route> {
        self.route_by_buyer.get(buyer)
    }

    /// Removes the reservation paid from `account` together with its indices.
    pub fn remove_by_account(&mut self, account: AccountNumber) -> Result<Reservation> {
        let buyer = self
            .buyer_by_account
            .remove(&account)
            .ok_or(TradeError::UnknownAccount(account))?;
        self.route_by_buyer.remove(&buyer);
        self.by_buyer
            .remove(&buyer)
            .ok_or(TradeError::ReservationNotFound(account))
    }

    pub fn pending(&self) -> Vec<Reservation> {
        let mut pending: Vec<Reservation> = self.by_buyer.values().cloned().collect();
        pending.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at));
        pending
    }

    pub fn len(&self) -> usize {
        self.by_buyer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_buyer.is_empty()
    }

    #[cfg(test)]
    fn indices_consistent(&self) -> bool {
        self.by_buyer.len() == self.buyer_by_account.len()
            && self.by_buyer.len() == self.route_by_buyer.len()
            && self.by_buyer.values().all(|r| {
                self.buyer_by_account.get(&r.buyer_account) == Some(&r.buyer)
                    && self.route_by_buyer.get(&r.buyer) == Some(&r.reply_route)
            })
    }
}

/// Result of handling one sale request against local state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved {
        seller_account: AccountNumber,
        good: Good,
        snapshot: Vec<Good>,
    },
    Denied {
        reason: String,
    },
}

#[derive(Debug)]
pub struct LocalState {
    identity: String,
    own_account: Option<AccountNumber>,
    pub inventory: InventoryStore,
    pub catalog: OfferCatalog,
    pub ledger: ReservationLedger,
}

impl LocalState {
    pub fn new(identity: impl Into<String>, goods: impl IntoIterator<Item = Good>) -> Self {
        let identity = identity.into();
        Self {
            catalog: OfferCatalog::new(identity.clone()),
            identity,
            own_account: None,
            inventory: InventoryStore::new(goods),
            ledger: ReservationLedger::default(),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn own_account(&self) -> Option<AccountNumber> {
        self.own_account
    }

    pub fn set_own_account(&mut self, account: AccountNumber) {
        self.own_account = Some(account);
    }

    /// Moves the requested good from the inventory into a reservation for
    /// the buyer. Removal and insertion happen in this one call, so a goods
    /// name can be reserved by at most one buyer.
    pub fn reserve(&mut self, request: &SaleRequest, reply_route: Route) -> Result<ReserveOutcome> {
        let seller_account = self.own_account.ok_or(TradeError::NotConnected)?;

        if !self.inventory.contains(&request.goods_name) {
            return Ok(ReserveOutcome::Denied {
                reason: crate::model::NO_SUCH_GOODS.to_string(),
            });
        }

        if self.ledger.has_pending(&request.buyer) {
            return Ok(ReserveOutcome::Denied {
                reason: crate::model::PURCHASE_PENDING.to_string(),
            });
        }

        let good = self
            .inventory
            .take(&request.goods_name)
            .ok_or_else(|| TradeError::ProtocolViolation(request.goods_name.clone()))?;
        let reservation = Reservation::new(
            request.buyer.clone(),
            request.buyer_account,
            reply_route,
            good.clone(),
        );

        if let Err(rejected) = self.ledger.insert(reservation) {
            // Another buyer is paying from the same account; keep the good on sale.
            self.inventory.insert(rejected.good);
            return Ok(ReserveOutcome::Denied {
                reason: crate::model::PURCHASE_PENDING.to_string(),
            });
        }

        Ok(ReserveOutcome::Reserved {
            seller_account,
            good,
            snapshot: self.inventory.snapshot(),
        })
    }

    /// Drops a paid reservation for good.
    pub fn complete_sale(&mut self, buyer_account: AccountNumber) -> Result<Reservation> {
        self.ledger.remove_by_account(buyer_account)
    }

    /// Cancels a reservation and puts its good back on sale. Returns the
    /// reservation and the inventory snapshot to broadcast.
    pub fn abort_sale(&mut self, buyer_account: AccountNumber) -> Result<(Reservation, Vec<Good>)> {
        let reservation = self.ledger.remove_by_account(buyer_account)?;
        if !self.inventory.insert(reservation.good.clone()) {
            tracing::warn!(goods = %reservation.good.name, "restocked goods name already on sale");
        }
        Ok((reservation, self.inventory.snapshot()))
    }

    /// Every good owned by this peer that has not been sold, on sale or reserved.
    pub fn owned_goods(&self) -> Vec<Good> {
        let mut goods = self.inventory.snapshot();
        goods.extend(self.ledger.pending().into_iter().map(|r| r.good));
        goods.sort_by(|a, b| a.name.cmp(&b.name));
        goods
    }
}
