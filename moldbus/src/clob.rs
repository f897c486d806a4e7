/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! C10: CLOB handler — the canonical sequenced consumer.
//!
//! Orders live in an arena (`Vec<Option<OrderNode>>`) addressed by index
//! handles rather than the source's intrusive, self-referential
//! prev/next-pointer list. Each side of each
//! instrument's book keeps its resting arena indices in an explicit
//! `Vec<usize>`, maintained in price-time priority by insertion; cancel and
//! full-fill removal are `O(book depth)` swap-removes, fine at the book
//! depths this core is sized for and a direct match for "explicit ordered
//! container" from the same redesign note.

use std::collections::HashMap;

use crate::messages::{
    AddOrder, ApplicationDefinition, ApplicationDiscovery, CancelOrder, EquityDefinition, FillOrder, RejectCancel, RejectOrder, Side,
};

struct OrderNode {
    order_id: u64,
    instrument_id: u16,
    side: Side,
    qty: u32,
    price: u64,
}

/// Single-threaded freelist for `OrderNode`s.
struct OrderPool {
    arena: Vec<Option<OrderNode>>,
    free_list: Vec<usize>,
}

impl OrderPool {
    fn new() -> OrderPool {
        OrderPool {
            arena: Vec::new(),
            free_list: Vec::new(),
        }
    }

    fn alloc(&mut self, node: OrderNode) -> usize {
        if let Some(idx) = self.free_list.pop() {
            self.arena[idx] = Some(node);
            idx
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        }
    }

    fn free(&mut self, idx: usize) {
        self.arena[idx] = None;
        self.free_list.push(idx);
    }

    fn get(&self, idx: usize) -> &OrderNode {
        self.arena[idx].as_ref().expect("dangling order handle")
    }

    fn get_mut(&mut self, idx: usize) -> &mut OrderNode {
        self.arena[idx].as_mut().expect("dangling order handle")
    }
}

struct Instrument {
    #[allow(dead_code)]
    ticker: String,
    /// Descending price, then ascending arrival time.
    bids: Vec<usize>,
    /// Ascending price, then ascending arrival time.
    asks: Vec<usize>,
}

/// Events the handler produces in response to one command, in emission
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClobEvent {
    AddOrderAccepted(AddOrder),
    RejectOrder(RejectOrder),
    FillOrder(FillOrder),
    CancelOrder(CancelOrder),
    RejectCancel(RejectCancel),
    EquityDefinitionAssigned(EquityDefinition),
    ApplicationDefinitionAssigned { application_id: u16, name: String },
}

pub struct Clob {
    instruments: Vec<Instrument>,
    order_pool: OrderPool,
    order_index: HashMap<u64, usize>,
    last_order_id: u64,
    last_instrument_id: u16,
    last_application_id: u16,
}

impl Clob {
    pub fn new() -> Clob {
        Clob {
            instruments: Vec::new(),
            order_pool: OrderPool::new(),
            order_index: HashMap::new(),
            last_order_id: 0,
            last_instrument_id: 0,
            last_application_id: 0,
        }
    }

    pub fn last_order_id(&self) -> u64 {
        self.last_order_id
    }

    /// Validates the name non-empty and assigns a monotonically increasing
    /// `application_id`.
    pub fn handle_application_definition(&mut self, def: &ApplicationDefinition) -> ClobEvent {
        self.last_application_id += 1;
        ClobEvent::ApplicationDefinitionAssigned {
            application_id: self.last_application_id,
            name: def.name.clone(),
        }
    }

    /// Validates the ticker non-empty and assigns `instrument_id`, creating
    /// empty bid/ask books.
    pub fn handle_equity_definition(&mut self, def: &EquityDefinition) -> ClobEvent {
        self.last_instrument_id += 1;
        self.instruments.push(Instrument {
            ticker: def.ticker.clone(),
            bids: Vec::new(),
            asks: Vec::new(),
        });
        ClobEvent::EquityDefinitionAssigned(EquityDefinition {
            instrument_id: self.last_instrument_id,
            ticker: def.ticker.clone(),
        })
    }

    /// Runs the order-acceptance validation sequence, then matches and books the
    /// residual. `side_valid` carries the result of checking the raw wire
    /// byte before `AddOrder::decode` coerced an unrecognized value —
    /// validation must see the real failure, not the coerced default.
    pub fn handle_add_order(&mut self, order: &AddOrder, side_valid: bool) -> Vec<ClobEvent> {
        if !side_valid {
            return vec![ClobEvent::RejectOrder(RejectOrder {
                order_id: order.order_id,
                reason: "invalid side".to_string(),
            })];
        }
        if order.qty == 0 {
            return vec![ClobEvent::RejectOrder(RejectOrder {
                order_id: order.order_id,
                reason: "invalid qty".to_string(),
            })];
        }
        if order.instrument_id == 0 || order.instrument_id as usize > self.instruments.len() {
            return vec![ClobEvent::RejectOrder(RejectOrder {
                order_id: order.order_id,
                reason: "invalid instrumentId".to_string(),
            })];
        }
        if order.price == 0 {
            return vec![ClobEvent::RejectOrder(RejectOrder {
                order_id: order.order_id,
                reason: "invalid price".to_string(),
            })];
        }

        self.last_order_id += 1;
        let order_id = self.last_order_id;
        let mut events = vec![ClobEvent::AddOrderAccepted(AddOrder {
            order_id,
            side: order.side,
            instrument_id: order.instrument_id,
            qty: order.qty,
            price: order.price,
        })];

        let mut remaining = order.qty;
        let instrument_idx = order.instrument_id as usize - 1;

        loop {
            if remaining == 0 {
                break;
            }
            let crossed = self.best_opposite_crosses(instrument_idx, order.side, order.price);
            let Some(resting_idx) = crossed else {
                break;
            };

            let (resting_order_id, resting_price, fill_qty, resting_exhausted) = {
                let resting = self.order_pool.get_mut(resting_idx);
                let fill_qty = remaining.min(resting.qty);
                resting.qty -= fill_qty;
                (resting.order_id, resting.price, fill_qty, resting.qty == 0)
            };

            remaining -= fill_qty;
            events.push(ClobEvent::FillOrder(FillOrder {
                order_id,
                qty: fill_qty,
                price: resting_price,
            }));
            events.push(ClobEvent::FillOrder(FillOrder {
                order_id: resting_order_id,
                qty: fill_qty,
                price: resting_price,
            }));

            if resting_exhausted {
                self.remove_resting(instrument_idx, order.side.opposite(), resting_idx);
                self.order_index.remove(&resting_order_id);
                self.order_pool.free(resting_idx);
            }
        }

        if remaining > 0 {
            let idx = self.order_pool.alloc(OrderNode {
                order_id,
                instrument_id: order.instrument_id,
                side: order.side,
                qty: remaining,
                price: order.price,
            });
            self.order_index.insert(order_id, idx);
            self.insert_resting(instrument_idx, order.side, idx);
        }

        events
    }

    pub fn handle_cancel_order(&mut self, cancel: &CancelOrder) -> ClobEvent {
        if cancel.order_id < 1 || cancel.order_id > self.last_order_id {
            return ClobEvent::RejectCancel(RejectCancel {
                order_id: cancel.order_id,
                reason: "unknown order".to_string(),
            });
        }
        let Some(&idx) = self.order_index.get(&cancel.order_id) else {
            return ClobEvent::RejectCancel(RejectCancel {
                order_id: cancel.order_id,
                reason: "too late to cancel".to_string(),
            });
        };
        let (instrument_id, side) = {
            let node = self.order_pool.get(idx);
            (node.instrument_id, node.side)
        };
        self.remove_resting(instrument_id as usize - 1, side, idx);
        self.order_index.remove(&cancel.order_id);
        self.order_pool.free(idx);
        ClobEvent::CancelOrder(CancelOrder {
            order_id: cancel.order_id,
        })
    }

    /// Copy-through subscription (spec §4.10): heartbeats don't touch book
    /// state, so this is liveness bookkeeping only, kept as an explicit
    /// handler rather than silently dropping the subscription.
    pub fn observe_heartbeat(&mut self) {}

    /// Copy-through subscription: application up/down notifications don't
    /// affect the book either, logged for traceability.
    pub fn observe_application_discovery(&mut self, discovery: &ApplicationDiscovery) {
        log::debug!("clob observed application discovery: {discovery:?}");
    }

    /// Copy-through subscription for reject events this handler did not
    /// itself emit — relevant to a passive follower mirroring another
    /// primary's stream; a no-op bookkeeping point in the active-primary
    /// role this binary runs in.
    pub fn observe_reject_order(&mut self, reject: &RejectOrder) {
        log::debug!("clob observed reject order (copy): {reject:?}");
    }

    pub fn observe_reject_cancel(&mut self, reject: &RejectCancel) {
        log::debug!("clob observed reject cancel (copy): {reject:?}");
    }

    /// Returns the arena index of the best resting order on the opposite
    /// side that crosses `price`, if any.
    fn best_opposite_crosses(&self, instrument_idx: usize, side: Side, price: u64) -> Option<usize> {
        let book = &self.instruments[instrument_idx];
        match side {
            Side::Buy => book.asks.first().copied().filter(|&idx| self.order_pool.get(idx).price <= price),
            Side::Sell => book.bids.first().copied().filter(|&idx| self.order_pool.get(idx).price >= price),
        }
    }

    fn insert_resting(&mut self, instrument_idx: usize, side: Side, idx: usize) {
        let price = self.order_pool.get(idx).price;
        let book = &mut self.instruments[instrument_idx];
        let list = match side {
            Side::Buy => &mut book.bids,
            Side::Sell => &mut book.asks,
        };
        let pos = list
            .iter()
            .position(|&existing| {
                let existing_price = self.order_pool.get(existing).price;
                match side {
                    Side::Buy => existing_price < price,
                    Side::Sell => existing_price > price,
                }
            })
            .unwrap_or(list.len());
        list.insert(pos, idx);
    }

    fn remove_resting(&mut self, instrument_idx: usize, side: Side, idx: usize) {
        let book = &mut self.instruments[instrument_idx];
        let list = match side {
            Side::Buy => &mut book.bids,
            Side::Sell => &mut book.asks,
        };
        if let Some(pos) = list.iter().position(|&existing| existing == idx) {
            list.remove(pos);
        }
    }
}

impl Default for Clob {
    fn default() -> Clob {
        Clob::new()
    }
}

impl Side {
    fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_with_aapl() -> Clob {
        let mut clob = Clob::new();
        clob.handle_equity_definition(&EquityDefinition {
            instrument_id: 0,
            ticker: "AAPL".to_string(),
        });
        clob
    }

    #[test]
    fn basic_match_scenario() {
        let mut clob = setup_with_aapl();

        let buy = AddOrder {
            order_id: 0,
            side: Side::Buy,
            instrument_id: 1,
            qty: 10,
            price: 100,
        };
        let events = clob.handle_add_order(&buy, true);
        assert_eq!(events, vec![ClobEvent::AddOrderAccepted(AddOrder { order_id: 1, ..buy })]);

        let sell = AddOrder {
            order_id: 0,
            side: Side::Sell,
            instrument_id: 1,
            qty: 4,
            price: 99,
        };
        let events = clob.handle_add_order(&sell, true);
        assert_eq!(
            events,
            vec![
                ClobEvent::AddOrderAccepted(AddOrder { order_id: 2, ..sell }),
                ClobEvent::FillOrder(FillOrder { order_id: 2, qty: 4, price: 100 }),
                ClobEvent::FillOrder(FillOrder { order_id: 1, qty: 4, price: 100 }),
            ]
        );
        assert_eq!(clob.last_order_id(), 2);
    }

    #[test]
    fn cancel_then_cancel_again_is_too_late() {
        let mut clob = setup_with_aapl();
        clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Buy, instrument_id: 1, qty: 10, price: 100 },
            true,
        );

        let event = clob.handle_cancel_order(&CancelOrder { order_id: 1 });
        assert_eq!(event, ClobEvent::CancelOrder(CancelOrder { order_id: 1 }));

        let event = clob.handle_cancel_order(&CancelOrder { order_id: 1 });
        assert_eq!(
            event,
            ClobEvent::RejectCancel(RejectCancel { order_id: 1, reason: "too late to cancel".to_string() })
        );
    }

    #[test]
    fn cancel_out_of_range_is_unknown_order() {
        let mut clob = setup_with_aapl();
        let event = clob.handle_cancel_order(&CancelOrder { order_id: 999 });
        assert_eq!(
            event,
            ClobEvent::RejectCancel(RejectCancel { order_id: 999, reason: "unknown order".to_string() })
        );
    }

    #[test]
    fn zero_qty_is_rejected_and_last_order_id_unchanged() {
        let mut clob = setup_with_aapl();
        let events = clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Buy, instrument_id: 1, qty: 0, price: 100 },
            true,
        );
        assert_eq!(
            events,
            vec![ClobEvent::RejectOrder(RejectOrder { order_id: 0, reason: "invalid qty".to_string() })]
        );
        assert_eq!(clob.last_order_id(), 0);
    }

    #[test]
    fn invalid_instrument_is_rejected() {
        let mut clob = Clob::new();
        let events = clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Buy, instrument_id: 1, qty: 1, price: 100 },
            true,
        );
        assert_eq!(
            events,
            vec![ClobEvent::RejectOrder(RejectOrder { order_id: 0, reason: "invalid instrumentId".to_string() })]
        );
    }

    #[test]
    fn invalid_side_is_rejected_before_qty_check() {
        let mut clob = setup_with_aapl();
        let events = clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Buy, instrument_id: 1, qty: 0, price: 100 },
            false,
        );
        assert_eq!(
            events,
            vec![ClobEvent::RejectOrder(RejectOrder { order_id: 0, reason: "invalid side".to_string() })]
        );
    }

    #[test]
    fn price_time_priority_orders_same_price_by_arrival() {
        let mut clob = setup_with_aapl();
        clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Buy, instrument_id: 1, qty: 5, price: 100 },
            true,
        );
        clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Buy, instrument_id: 1, qty: 5, price: 100 },
            true,
        );
        // A resting sell that only partially crosses should fill the
        // earlier-arrived order (order_id=1) first.
        let events = clob.handle_add_order(
            &AddOrder { order_id: 0, side: Side::Sell, instrument_id: 1, qty: 3, price: 100 },
            true,
        );
        assert!(events.iter().any(|e| *e == ClobEvent::FillOrder(FillOrder { order_id: 1, qty: 3, price: 100 })));
    }
}
