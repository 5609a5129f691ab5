//! Paper broker for testing and dry runs.
//!
//! Holds positions and resting orders in memory and fills marketable orders
//! immediately at the last set price. Failure injection covers rejected
//! orders, held fills (orders accepted but never filled), unreachable
//! position queries and added latency.
//!
//! Suitable for testing and development. Not for production use.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;

use crate::clock::Clock;
use crate::models::{BrokerPosition, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::ports::{
    BrokerError, BrokerPositionProvider, OrderAck, OrderExecutionGateway, OrderRequest,
};

/// An order resting at the paper broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingOrder {
    /// Broker order id.
    pub order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Unsigned quantity.
    pub quantity: Decimal,
    /// Order type.
    pub order_type: OrderType,
    /// Limit or stop price.
    pub price: Option<Decimal>,
}

impl RestingOrder {
    fn ack(&self) -> OrderAck {
        OrderAck {
            order_id: self.order_id.clone(),
            client_order_id: String::new(),
            symbol: self.symbol.clone(),
            order_type: self.order_type,
            status: OrderStatus::Working,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    positions: BTreeMap<String, BrokerPosition>,
    prices: BTreeMap<String, Decimal>,
    resting: BTreeMap<String, RestingOrder>,
    submitted: Vec<OrderRequest>,
    cancelled: Vec<String>,
    reject_market: BTreeSet<String>,
    reject_all: BTreeSet<String>,
    reject_protective: BTreeSet<String>,
    hold_fills: BTreeSet<String>,
    positions_unavailable: bool,
    latency: Option<Duration>,
}

/// In-memory broker implementing both broker ports.
#[derive(Debug)]
pub struct PaperBroker {
    clock: Arc<dyn Clock>,
    book: Mutex<Book>,
    next_id: AtomicU64,
}

impl PaperBroker {
    /// Create an empty paper account.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            book: Mutex::new(Book::default()),
            next_id: AtomicU64::new(1),
        }
    }

    // =========================================================================
    // Test setup
    // =========================================================================

    /// Set (or with zero quantity, remove) a broker position.
    pub fn set_position(&self, symbol: &str, quantity: Decimal, average_price: Decimal) {
        let mut book = self.book.lock();
        if quantity.is_zero() {
            book.positions.remove(symbol);
            return;
        }
        book.positions.insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                quantity,
                average_price,
                unrealized_pnl: Decimal::ZERO,
                last_update: self.clock.now(),
            },
        );
    }

    /// Set the last traded price used for fills.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.book.lock().prices.insert(symbol.to_string(), price);
    }

    /// Reject market orders for a symbol; limit orders still fill.
    pub fn reject_market_orders_for(&self, symbol: &str) {
        self.book.lock().reject_market.insert(symbol.to_string());
    }

    /// Reject every order for a symbol.
    pub fn reject_all_orders_for(&self, symbol: &str) {
        self.book.lock().reject_all.insert(symbol.to_string());
    }

    /// Reject stop and target placements for a symbol.
    pub fn reject_protective_orders_for(&self, symbol: &str) {
        self.book.lock().reject_protective.insert(symbol.to_string());
    }

    /// Accept orders for a symbol but never fill them.
    pub fn hold_fills_for(&self, symbol: &str) {
        self.book.lock().hold_fills.insert(symbol.to_string());
    }

    /// Resume filling orders for a symbol.
    pub fn release_fills_for(&self, symbol: &str) {
        self.book.lock().hold_fills.remove(symbol);
    }

    /// Make position queries fail with a connection error.
    pub fn set_positions_unavailable(&self, unavailable: bool) {
        self.book.lock().positions_unavailable = unavailable;
    }

    /// Delay every order call.
    pub fn set_latency(&self, latency: Duration) {
        self.book.lock().latency = Some(latency);
    }

    /// Place a resting order directly, as if it predated the session.
    pub fn add_resting(&self, order: RestingOrder) {
        self.book
            .lock()
            .resting
            .insert(order.order_id.clone(), order);
    }

    /// Fill a resting order in full at its own price, as if the market
    /// traded through it. Returns `false` if the order is not resting.
    pub fn fill_resting(&self, order_id: &str) -> bool {
        let now = self.clock.now();
        let mut book = self.book.lock();
        let Some(order) = book.resting.remove(order_id) else {
            return false;
        };
        let price = order
            .price
            .or_else(|| book.prices.get(&order.symbol).copied())
            .unwrap_or_default();
        Self::apply_fill(&mut book, &order.symbol, order.side, order.quantity, price, now);
        true
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every order request received, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.book.lock().submitted.clone()
    }

    /// Market order requests received.
    #[must_use]
    pub fn submitted_market_orders(&self) -> Vec<OrderRequest> {
        self.book
            .lock()
            .submitted
            .iter()
            .filter(|r| r.order_type == OrderType::Market)
            .cloned()
            .collect()
    }

    /// Ids of successfully cancelled orders.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.book.lock().cancelled.clone()
    }

    /// Orders still resting.
    #[must_use]
    pub fn resting_orders(&self) -> Vec<RestingOrder> {
        self.book.lock().resting.values().cloned().collect()
    }

    /// Resting orders of one type for a symbol.
    #[must_use]
    pub fn resting_of(&self, symbol: &str, order_type: OrderType) -> Vec<RestingOrder> {
        self.book
            .lock()
            .resting
            .values()
            .filter(|o| o.symbol == symbol && o.order_type == order_type)
            .cloned()
            .collect()
    }

    /// Signed broker quantity for a symbol.
    #[must_use]
    pub fn position_quantity(&self, symbol: &str) -> Decimal {
        self.book
            .lock()
            .positions
            .get(symbol)
            .map_or(Decimal::ZERO, |p| p.quantity)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn simulate_latency(&self) {
        let latency = self.book.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply_fill(
        book: &mut Book,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) {
        let delta = quantity * side.sign();
        let entry = book
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| BrokerPosition {
                symbol: symbol.to_string(),
                quantity: Decimal::ZERO,
                average_price: price,
                unrealized_pnl: Decimal::ZERO,
                last_update: now,
            });

        let before = entry.quantity;
        let after = before + delta;
        // Average price only moves when adding to (or flipping) the position.
        if before.is_zero() || (after.signum() != before.signum() && !after.is_zero()) {
            entry.average_price = price;
        } else if after.abs() > before.abs() {
            entry.average_price =
                (entry.average_price * before.abs() + price * quantity) / after.abs();
        }
        entry.quantity = after;
        entry.last_update = now;

        if after.is_zero() {
            book.positions.remove(symbol);
        }
    }

    fn marketable(side: OrderSide, limit: Decimal, last: Decimal) -> bool {
        match side {
            OrderSide::Buy => limit >= last,
            OrderSide::Sell => limit <= last,
        }
    }

    fn rest(
        &self,
        book: &mut Book,
        request: &OrderRequest,
        order_type: OrderType,
        price: Option<Decimal>,
    ) -> OrderAck {
        let order = RestingOrder {
            order_id: self.next_order_id(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            order_type,
            price,
        };
        let mut ack = order.ack();
        ack.client_order_id.clone_from(&request.client_order_id);
        book.resting.insert(order.order_id.clone(), order);
        ack
    }

    fn place_protective(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        order_type: OrderType,
    ) -> Result<OrderAck, BrokerError> {
        let mut book = self.book.lock();
        if book.reject_protective.contains(symbol) || book.reject_all.contains(symbol) {
            return Err(BrokerError::OrderRejected {
                reason: format!("{} rejected for {symbol}", order_type.as_str()),
            });
        }
        let request = OrderRequest::limit(symbol, side, quantity, price)
            .with_time_in_force(TimeInForce::Gtc);
        Ok(self.rest(&mut book, &request, order_type, Some(price)))
    }
}

#[async_trait]
impl BrokerPositionProvider for PaperBroker {
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let book = self.book.lock();
        if book.positions_unavailable {
            return Err(BrokerError::ConnectionError {
                message: "paper broker unreachable".to_string(),
            });
        }
        Ok(book.positions.values().cloned().collect())
    }
}

#[async_trait]
impl OrderExecutionGateway for PaperBroker {
    async fn submit(&self, request: OrderRequest) -> Result<OrderAck, BrokerError> {
        self.simulate_latency().await;
        let now = self.clock.now();
        let mut book = self.book.lock();
        book.submitted.push(request.clone());

        if book.reject_all.contains(&request.symbol)
            || (request.order_type == OrderType::Market
                && book.reject_market.contains(&request.symbol))
        {
            return Err(BrokerError::OrderRejected {
                reason: format!(
                    "{} order rejected for {}",
                    request.order_type.as_str(),
                    request.symbol
                ),
            });
        }

        let last = book.prices.get(&request.symbol).copied();
        let fill_price = match (request.order_type, request.limit_price, last) {
            (OrderType::Market, _, Some(last)) => Some(last),
            (OrderType::Limit, Some(limit), Some(last))
                if Self::marketable(request.side, limit, last) =>
            {
                Some(limit)
            }
            _ => None,
        };

        let held = book.hold_fills.contains(&request.symbol);
        match fill_price {
            Some(price) if !held => {
                Self::apply_fill(
                    &mut book,
                    &request.symbol,
                    request.side,
                    request.quantity,
                    price,
                    now,
                );
                Ok(OrderAck {
                    order_id: self.next_order_id(),
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    order_type: request.order_type,
                    status: OrderStatus::Filled,
                    filled_qty: request.quantity,
                    avg_fill_price: Some(price),
                })
            }
            _ if request.time_in_force == TimeInForce::Ioc && !held => Ok(OrderAck {
                order_id: self.next_order_id(),
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                order_type: request.order_type,
                status: OrderStatus::Cancelled,
                filled_qty: Decimal::ZERO,
                avg_fill_price: None,
            }),
            _ => Ok(self.rest(&mut book, &request, request.order_type, request.limit_price)),
        }
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        self.simulate_latency().await;
        let mut book = self.book.lock();
        if book.resting.remove(order_id).is_none() {
            return Err(BrokerError::OrderNotFound {
                order_id: order_id.to_string(),
            });
        }
        book.cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn place_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        self.simulate_latency().await;
        self.place_protective(symbol, side, quantity, stop_price, OrderType::Stop)
    }

    async fn place_target(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        self.simulate_latency().await;
        self.place_protective(symbol, side, quantity, limit_price, OrderType::Target)
    }

    async fn open_orders(&self) -> Result<Vec<OrderAck>, BrokerError> {
        Ok(self
            .book
            .lock()
            .resting
            .values()
            .map(RestingOrder::ack)
            .collect())
    }
}
