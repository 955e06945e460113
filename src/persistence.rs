//! SQLite-backed persistence for portfolios, positions, orders, trades and
//! margin-block audit rows: one connection behind a mutex, WAL journaling,
//! idempotent schema setup.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::info;

use crate::domain::{
    MarginBlock, MarginMode, Order, OrderId, OrderParams, OrderStatus, OrderType, PortfolioId,
    Portfolio, Position, PositionId, PositionSide, PositionStatus, Side, Symbol, TimeInForce,
    Trade, TradeId, TrailingState,
};
use crate::error::{CoreError, CoreResult};

/// Everything the engine needs to durably store. A `PersistenceFailure`
/// carries the underlying database error message; callers roll back their
/// in-memory state and surface it to the consumer.
pub trait Store: Send + Sync {
    fn save_portfolio(&self, portfolio: &Portfolio) -> CoreResult<()>;
    fn load_portfolio(&self, id: PortfolioId) -> CoreResult<Option<Portfolio>>;

    fn save_position(&self, position: &Position) -> CoreResult<()>;
    fn load_open_positions(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Position>>;
    fn load_closed_positions(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Position>>;

    fn save_order(&self, order: &Order) -> CoreResult<()>;
    fn load_order(&self, id: OrderId) -> CoreResult<Option<Order>>;
    fn load_orders(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Order>>;

    fn insert_trade(&self, trade: &Trade) -> CoreResult<()>;
    fn load_trades(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Trade>>;

    /// Record that margin was set aside for a resting order. Purely
    /// observational: never read back to compute available balance.
    fn save_margin_block(&self, block: &MarginBlock) -> CoreResult<()>;
    fn release_margin_block(&self, id: u64) -> CoreResult<()>;

    /// Persist the results of one fill atomically: the order's new state,
    /// every position it touched, the trade row, and the portfolio's new
    /// balance all commit together or not at all.
    fn commit_fill(
        &self,
        portfolio: &Portfolio,
        order: &Order,
        positions: &[Position],
        trade: &Trade,
    ) -> CoreResult<()>;

    /// Wipe every position/order/trade for a portfolio and reset its
    /// balance to `initial_balance`.
    fn reset_account(&self, portfolio_id: PortfolioId, initial_balance: Decimal) -> CoreResult<()>;
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> CoreResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        }
        let conn = Connection::open(db_path).map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;

        let store = SqliteStore { conn: Arc::new(Mutex::new(conn)) };
        store.create_tables()?;
        info!("sqlite store initialized at {}", db_path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        let store = SqliteStore { conn: Arc::new(Mutex::new(conn)) };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS portfolios (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                provider_tag TEXT NOT NULL,
                initial_balance TEXT NOT NULL,
                current_balance TEXT NOT NULL,
                currency TEXT NOT NULL,
                margin_mode TEXT NOT NULL,
                leverage TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY,
                portfolio_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                leverage TEXT NOT NULL,
                margin_mode TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                status TEXT NOT NULL,
                current_price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                liquidation_price TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_portfolio ON positions(portfolio_id);
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY,
                portfolio_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                stop_price TEXT,
                time_in_force TEXT NOT NULL,
                reduce_only INTEGER NOT NULL,
                trailing_percent TEXT,
                trailing_amount TEXT,
                iceberg_qty TEXT,
                leverage TEXT NOT NULL,
                margin_mode TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                avg_fill_price TEXT,
                status TEXT NOT NULL,
                trailing_extreme TEXT,
                trailing_stop TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                filled_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_portfolio ON orders(portfolio_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY,
                portfolio_id INTEGER NOT NULL,
                order_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                fee_rate TEXT NOT NULL,
                is_maker INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_portfolio ON trades(portfolio_id);
            CREATE TABLE IF NOT EXISTS margin_blocks (
                id INTEGER PRIMARY KEY,
                portfolio_id INTEGER NOT NULL,
                order_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                blocked_amount TEXT NOT NULL,
                created_at TEXT NOT NULL,
                released_at TEXT
            );",
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }
}

fn dec_to_text(d: Decimal) -> String {
    d.to_string()
}

fn dec_from_text(s: &str) -> CoreResult<Decimal> {
    Decimal::from_str(s).map_err(|e| CoreError::PersistenceFailure(format!("bad decimal {s:?}: {e}")))
}

fn opt_dec_to_text(d: Option<Decimal>) -> Option<String> {
    d.map(dec_to_text)
}

fn opt_dec_from_text(s: Option<String>) -> CoreResult<Option<Decimal>> {
    s.map(|s| dec_from_text(&s)).transpose()
}

fn ts_to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_text(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::PersistenceFailure(format!("bad timestamp {s:?}: {e}")))
}

fn opt_ts_to_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_text)
}

fn opt_ts_from_text(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    s.map(|s| ts_from_text(&s)).transpose()
}

fn margin_mode_to_text(m: MarginMode) -> &'static str {
    match m {
        MarginMode::Cross => "cross",
        MarginMode::Isolated => "isolated",
    }
}

fn margin_mode_from_text(s: &str) -> CoreResult<MarginMode> {
    match s {
        "cross" => Ok(MarginMode::Cross),
        "isolated" => Ok(MarginMode::Isolated),
        other => Err(CoreError::PersistenceFailure(format!("unknown margin_mode {other:?}"))),
    }
}

fn side_to_text(s: Side) -> &'static str {
    match s {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn side_from_text(s: &str) -> CoreResult<Side> {
    match s {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(CoreError::PersistenceFailure(format!("unknown side {other:?}"))),
    }
}

fn position_side_to_text(s: PositionSide) -> &'static str {
    match s {
        PositionSide::Long => "long",
        PositionSide::Short => "short",
    }
}

fn position_side_from_text(s: &str) -> CoreResult<PositionSide> {
    match s {
        "long" => Ok(PositionSide::Long),
        "short" => Ok(PositionSide::Short),
        other => Err(CoreError::PersistenceFailure(format!("unknown position side {other:?}"))),
    }
}

fn position_status_to_text(s: PositionStatus) -> &'static str {
    match s {
        PositionStatus::Open => "open",
        PositionStatus::Closed => "closed",
    }
}

fn position_status_from_text(s: &str) -> CoreResult<PositionStatus> {
    match s {
        "open" => Ok(PositionStatus::Open),
        "closed" => Ok(PositionStatus::Closed),
        other => Err(CoreError::PersistenceFailure(format!("unknown position status {other:?}"))),
    }
}

fn order_type_to_text(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::Stop => "stop",
        OrderType::StopLimit => "stop_limit",
        OrderType::TrailingStop => "trailing_stop",
        OrderType::Iceberg => "iceberg",
    }
}

fn order_type_from_text(s: &str) -> CoreResult<OrderType> {
    match s {
        "market" => Ok(OrderType::Market),
        "limit" => Ok(OrderType::Limit),
        "stop" => Ok(OrderType::Stop),
        "stop_limit" => Ok(OrderType::StopLimit),
        "trailing_stop" => Ok(OrderType::TrailingStop),
        "iceberg" => Ok(OrderType::Iceberg),
        other => Err(CoreError::PersistenceFailure(format!("unknown order type {other:?}"))),
    }
}

fn tif_to_text(t: TimeInForce) -> &'static str {
    match t {
        TimeInForce::GTC => "gtc",
        TimeInForce::IOC => "ioc",
        TimeInForce::FOK => "fok",
        TimeInForce::PO => "po",
    }
}

fn tif_from_text(s: &str) -> CoreResult<TimeInForce> {
    match s {
        "gtc" => Ok(TimeInForce::GTC),
        "ioc" => Ok(TimeInForce::IOC),
        "fok" => Ok(TimeInForce::FOK),
        "po" => Ok(TimeInForce::PO),
        other => Err(CoreError::PersistenceFailure(format!("unknown time_in_force {other:?}"))),
    }
}

fn order_status_to_text(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "pending",
        OrderStatus::Triggered => "triggered",
        OrderStatus::Partial => "partial",
        OrderStatus::Filled => "filled",
        OrderStatus::Cancelled => "cancelled",
        OrderStatus::Rejected => "rejected",
    }
}

fn order_status_from_text(s: &str) -> CoreResult<OrderStatus> {
    match s {
        "pending" => Ok(OrderStatus::Pending),
        "triggered" => Ok(OrderStatus::Triggered),
        "partial" => Ok(OrderStatus::Partial),
        "filled" => Ok(OrderStatus::Filled),
        "cancelled" => Ok(OrderStatus::Cancelled),
        "rejected" => Ok(OrderStatus::Rejected),
        other => Err(CoreError::PersistenceFailure(format!("unknown order status {other:?}"))),
    }
}

fn position_from_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, Position)> {
    let row_id: i64 = row.get(0)?;
    let portfolio_id: i64 = row.get(1)?;
    let symbol: String = row.get(2)?;
    let side: String = row.get(3)?;
    let entry_price: String = row.get(4)?;
    let quantity: String = row.get(5)?;
    let leverage: String = row.get(6)?;
    let margin_mode: String = row.get(7)?;
    let opened_at: String = row.get(8)?;
    let closed_at: Option<String> = row.get(9)?;
    let status: String = row.get(10)?;
    let current_price: String = row.get(11)?;
    let realized_pnl: String = row.get(12)?;
    let liquidation_price: Option<String> = row.get(13)?;

    let position = Position {
        id: PositionId(row_id as u64),
        portfolio_id: PortfolioId(portfolio_id as u64),
        symbol: Symbol::new(symbol),
        side: position_side_from_text(&side).unwrap_or(PositionSide::Long),
        entry_price: Decimal::from_str(&entry_price).unwrap_or_default(),
        quantity: Decimal::from_str(&quantity).unwrap_or_default(),
        leverage: Decimal::from_str(&leverage).unwrap_or_default(),
        margin_mode: margin_mode_from_text(&margin_mode).unwrap_or(MarginMode::Cross),
        opened_at: ts_from_text(&opened_at).unwrap_or_else(|_| Utc::now()),
        closed_at: closed_at.and_then(|s| ts_from_text(&s).ok()),
        status: position_status_from_text(&status).unwrap_or(PositionStatus::Open),
        current_price: Decimal::from_str(&current_price).unwrap_or_default(),
        realized_pnl: Decimal::from_str(&realized_pnl).unwrap_or_default(),
        liquidation_price: liquidation_price.and_then(|s| Decimal::from_str(&s).ok()),
    };
    Ok((row_id, position))
}

impl Store for SqliteStore {
    fn save_portfolio(&self, portfolio: &Portfolio) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT INTO portfolios (id, name, provider_tag, initial_balance, current_balance, currency, margin_mode, leverage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, current_balance=excluded.current_balance,
                margin_mode=excluded.margin_mode, leverage=excluded.leverage",
            params![
                portfolio.id.0,
                portfolio.name,
                portfolio.provider_tag,
                dec_to_text(portfolio.initial_balance),
                dec_to_text(portfolio.current_balance),
                portfolio.currency,
                margin_mode_to_text(portfolio.margin_mode),
                dec_to_text(portfolio.leverage),
            ],
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    fn load_portfolio(&self, id: PortfolioId) -> CoreResult<Option<Portfolio>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.query_row(
            "SELECT id, name, provider_tag, initial_balance, current_balance, currency, margin_mode, leverage
             FROM portfolios WHERE id = ?1",
            params![id.0],
            |row| {
                Ok(Portfolio {
                    id: PortfolioId(row.get::<_, i64>(0)? as u64),
                    name: row.get(1)?,
                    provider_tag: row.get(2)?,
                    initial_balance: Decimal::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                    current_balance: Decimal::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
                    currency: row.get(5)?,
                    margin_mode: margin_mode_from_text(&row.get::<_, String>(6)?).unwrap_or(MarginMode::Cross),
                    leverage: Decimal::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
                })
            },
        )
        .optional()
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))
    }

    fn save_position(&self, position: &Position) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        insert_position(&conn, position)
    }

    fn load_open_positions(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Position>> {
        load_positions_with_status(&self.conn, portfolio_id, "open")
    }

    fn load_closed_positions(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Position>> {
        load_positions_with_status(&self.conn, portfolio_id, "closed")
    }

    fn save_order(&self, order: &Order) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        insert_order(&conn, order)
    }

    fn load_order(&self, id: OrderId) -> CoreResult<Option<Order>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id.0], order_from_row)
            .optional()
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?
            .transpose()
    }

    fn load_orders(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Order>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM orders WHERE portfolio_id = ?1")
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        let rows = stmt
            .query_map(params![portfolio_id.0], order_from_row)
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?
            .into_iter()
            .collect()
    }

    fn insert_trade(&self, trade: &Trade) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        insert_trade_row(&conn, trade)
    }

    fn load_trades(&self, portfolio_id: PortfolioId) -> CoreResult<Vec<Trade>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM trades WHERE portfolio_id = ?1 ORDER BY id")
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        let rows = stmt
            .query_map(params![portfolio_id.0], trade_from_row)
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?
            .into_iter()
            .collect()
    }

    fn commit_fill(
        &self,
        portfolio: &Portfolio,
        order: &Order,
        positions: &[Position],
        trade: &Trade,
    ) -> CoreResult<()> {
        let mut conn = self.conn.lock().expect("sqlite connection poisoned");
        let tx = conn.transaction().map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;

        tx.execute(
            "INSERT INTO portfolios (id, name, provider_tag, initial_balance, current_balance, currency, margin_mode, leverage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET current_balance=excluded.current_balance",
            params![
                portfolio.id.0,
                portfolio.name,
                portfolio.provider_tag,
                dec_to_text(portfolio.initial_balance),
                dec_to_text(portfolio.current_balance),
                portfolio.currency,
                margin_mode_to_text(portfolio.margin_mode),
                dec_to_text(portfolio.leverage),
            ],
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;

        insert_order(&tx, order)?;
        for position in positions {
            insert_position(&tx, position)?;
        }
        insert_trade_row(&tx, trade)?;

        tx.commit().map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    fn save_margin_block(&self, block: &MarginBlock) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT INTO margin_blocks (id, portfolio_id, order_id, symbol, blocked_amount, created_at, released_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET released_at=excluded.released_at",
            params![
                block.id,
                block.portfolio_id.0,
                block.order_id.0,
                block.symbol.as_str(),
                dec_to_text(block.blocked_amount),
                ts_to_text(block.created_at),
                opt_ts_to_text(block.released_at),
            ],
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    fn release_margin_block(&self, id: u64) -> CoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "UPDATE margin_blocks SET released_at = ?2 WHERE id = ?1",
            params![id, ts_to_text(Utc::now())],
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    fn reset_account(&self, portfolio_id: PortfolioId, initial_balance: Decimal) -> CoreResult<()> {
        let mut conn = self.conn.lock().expect("sqlite connection poisoned");
        let tx = conn.transaction().map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        tx.execute("DELETE FROM positions WHERE portfolio_id = ?1", params![portfolio_id.0])
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        tx.execute("DELETE FROM orders WHERE portfolio_id = ?1", params![portfolio_id.0])
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        tx.execute("DELETE FROM trades WHERE portfolio_id = ?1", params![portfolio_id.0])
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        tx.execute("DELETE FROM margin_blocks WHERE portfolio_id = ?1", params![portfolio_id.0])
            .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        tx.execute(
            "UPDATE portfolios SET current_balance = ?2, initial_balance = ?2 WHERE id = ?1",
            params![portfolio_id.0, dec_to_text(initial_balance)],
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        tx.commit().map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }
}

fn insert_position(conn: &Connection, position: &Position) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO positions (id, portfolio_id, symbol, side, entry_price, quantity, leverage, margin_mode,
            opened_at, closed_at, status, current_price, realized_pnl, liquidation_price)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
            quantity=excluded.quantity, closed_at=excluded.closed_at, status=excluded.status,
            current_price=excluded.current_price, realized_pnl=excluded.realized_pnl,
            liquidation_price=excluded.liquidation_price, entry_price=excluded.entry_price",
        params![
            position.id.0,
            position.portfolio_id.0,
            position.symbol.as_str(),
            position_side_to_text(position.side),
            dec_to_text(position.entry_price),
            dec_to_text(position.quantity),
            dec_to_text(position.leverage),
            margin_mode_to_text(position.margin_mode),
            ts_to_text(position.opened_at),
            opt_ts_to_text(position.closed_at),
            position_status_to_text(position.status),
            dec_to_text(position.current_price),
            dec_to_text(position.realized_pnl),
            opt_dec_to_text(position.liquidation_price),
        ],
    )
    .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
    Ok(())
}

fn load_positions_with_status(
    conn: &Mutex<Connection>,
    portfolio_id: PortfolioId,
    status: &str,
) -> CoreResult<Vec<Position>> {
    let conn = conn.lock().expect("sqlite connection poisoned");
    let mut stmt = conn
        .prepare(
            "SELECT id, portfolio_id, symbol, side, entry_price, quantity, leverage, margin_mode,
                opened_at, closed_at, status, current_price, realized_pnl, liquidation_price
             FROM positions WHERE portfolio_id = ?1 AND status = ?2",
        )
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
    let rows = stmt
        .query_map(params![portfolio_id.0, status], position_from_row)
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
    rows.map(|r| r.map(|(_, p)| p))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::PersistenceFailure(e.to_string()))
}

fn insert_order(conn: &Connection, order: &Order) -> CoreResult<()> {
    let (trailing_extreme, trailing_stop) = match order.trailing_state {
        Some(TrailingState { extreme_price, stop_price }) => {
            (Some(dec_to_text(extreme_price)), Some(dec_to_text(stop_price)))
        }
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO orders (id, portfolio_id, symbol, side, order_type, quantity, price, stop_price,
            time_in_force, reduce_only, trailing_percent, trailing_amount, iceberg_qty, leverage,
            margin_mode, filled_quantity, avg_fill_price, status, trailing_extreme, trailing_stop,
            created_at, updated_at, filled_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)
         ON CONFLICT(id) DO UPDATE SET
            quantity=excluded.quantity, price=excluded.price, stop_price=excluded.stop_price,
            filled_quantity=excluded.filled_quantity, avg_fill_price=excluded.avg_fill_price,
            status=excluded.status, trailing_extreme=excluded.trailing_extreme,
            trailing_stop=excluded.trailing_stop, updated_at=excluded.updated_at, filled_at=excluded.filled_at",
        params![
            order.id.0,
            order.portfolio_id.0,
            order.symbol.as_str(),
            side_to_text(order.side),
            order_type_to_text(order.order_type),
            dec_to_text(order.quantity),
            opt_dec_to_text(order.price),
            opt_dec_to_text(order.stop_price),
            tif_to_text(order.time_in_force),
            order.reduce_only as i64,
            opt_dec_to_text(order.trailing_percent),
            opt_dec_to_text(order.trailing_amount),
            opt_dec_to_text(order.iceberg_qty),
            dec_to_text(order.leverage),
            margin_mode_to_text(order.margin_mode),
            dec_to_text(order.filled_quantity),
            opt_dec_to_text(order.avg_fill_price),
            order_status_to_text(order.status),
            trailing_extreme,
            trailing_stop,
            ts_to_text(order.created_at),
            ts_to_text(order.updated_at),
            opt_ts_to_text(order.filled_at),
        ],
    )
    .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
    Ok(())
}

fn order_from_row(row: &rusqlite::Row) -> rusqlite::Result<CoreResult<Order>> {
    let build = || -> CoreResult<Order> {
        let trailing_extreme: Option<String> = row.get(18)?;
        let trailing_stop: Option<String> = row.get(19)?;
        let trailing_state = match (trailing_extreme, trailing_stop) {
            (Some(e), Some(s)) => Some(TrailingState {
                extreme_price: dec_from_text(&e)?,
                stop_price: dec_from_text(&s)?,
            }),
            _ => None,
        };
        let params = OrderParams {
            price: opt_dec_from_text(row.get(6)?)?,
            stop_price: opt_dec_from_text(row.get(7)?)?,
            time_in_force: Some(tif_from_text(&row.get::<_, String>(8)?)?),
            reduce_only: row.get::<_, i64>(9)? != 0,
            trailing_percent: opt_dec_from_text(row.get(10)?)?,
            trailing_amount: opt_dec_from_text(row.get(11)?)?,
            iceberg_qty: opt_dec_from_text(row.get(12)?)?,
            leverage: Some(dec_from_text(&row.get::<_, String>(13)?)?),
            margin_mode: Some(margin_mode_from_text(&row.get::<_, String>(14)?)?),
        };
        let mut order = Order::new(
            PortfolioId(row.get::<_, i64>(1)? as u64),
            Symbol::new(row.get::<_, String>(2)?),
            side_from_text(&row.get::<_, String>(3)?)?,
            order_type_from_text(&row.get::<_, String>(4)?)?,
            dec_from_text(&row.get::<_, String>(5)?)?,
            params,
            Decimal::ONE,
            MarginMode::Cross,
        );
        order.id = OrderId(row.get::<_, i64>(0)? as u64);
        order.filled_quantity = dec_from_text(&row.get::<_, String>(15)?)?;
        order.avg_fill_price = opt_dec_from_text(row.get(16)?)?;
        order.status = order_status_from_text(&row.get::<_, String>(17)?)?;
        order.trailing_state = trailing_state;
        order.created_at = ts_from_text(&row.get::<_, String>(20)?)?;
        order.updated_at = ts_from_text(&row.get::<_, String>(21)?)?;
        order.filled_at = opt_ts_from_text(row.get(22)?)?;
        Ok(order)
    };
    Ok(build())
}

fn insert_trade_row(conn: &Connection, trade: &Trade) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO trades (id, portfolio_id, order_id, symbol, side, price, quantity, fee, fee_rate, is_maker, timestamp)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
         ON CONFLICT(id) DO NOTHING",
        params![
            trade.id.0,
            trade.portfolio_id.0,
            trade.order_id.0,
            trade.symbol.as_str(),
            side_to_text(trade.side),
            dec_to_text(trade.price),
            dec_to_text(trade.quantity),
            dec_to_text(trade.fee),
            dec_to_text(trade.fee_rate),
            trade.is_maker as i64,
            ts_to_text(trade.timestamp),
        ],
    )
    .map_err(|e| CoreError::PersistenceFailure(e.to_string()))?;
    Ok(())
}

fn trade_from_row(row: &rusqlite::Row) -> rusqlite::Result<CoreResult<Trade>> {
    let build = || -> CoreResult<Trade> {
        Ok(Trade {
            id: TradeId(row.get::<_, i64>(0)? as u64),
            portfolio_id: PortfolioId(row.get::<_, i64>(1)? as u64),
            order_id: OrderId(row.get::<_, i64>(2)? as u64),
            symbol: Symbol::new(row.get::<_, String>(3)?),
            side: side_from_text(&row.get::<_, String>(4)?)?,
            price: dec_from_text(&row.get::<_, String>(5)?)?,
            quantity: dec_from_text(&row.get::<_, String>(6)?)?,
            fee: dec_from_text(&row.get::<_, String>(7)?)?,
            fee_rate: dec_from_text(&row.get::<_, String>(8)?)?,
            is_maker: row.get::<_, i64>(9)? != 0,
            timestamp: ts_from_text(&row.get::<_, String>(10)?)?,
        })
    };
    Ok(build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn portfolio_round_trips_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let portfolio = Portfolio::new("acct", "paper", dec!(10000), "USD", MarginMode::Cross, dec!(1));
        store.save_portfolio(&portfolio).unwrap();
        let loaded = store.load_portfolio(portfolio.id).unwrap().unwrap();
        assert_eq!(loaded.current_balance, dec!(10000));
        assert_eq!(loaded.name, "acct");
    }

    #[test]
    fn missing_portfolio_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_portfolio(PortfolioId(999)).unwrap().is_none());
    }

    #[test]
    fn order_round_trips_with_trailing_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut order = Order::new(
            PortfolioId(1),
            Symbol::new("BTC/USD"),
            Side::Sell,
            OrderType::TrailingStop,
            dec!(1),
            OrderParams {
                trailing_percent: Some(dec!(2)),
                ..Default::default()
            },
            dec!(1),
            MarginMode::Cross,
        );
        order.trailing_state = Some(TrailingState { extreme_price: dec!(100), stop_price: dec!(98) });
        store.save_order(&order).unwrap();
        let loaded = store.load_order(order.id).unwrap().unwrap();
        assert_eq!(loaded.trailing_state.unwrap().stop_price, dec!(98));
    }

    #[test]
    fn commit_fill_persists_order_position_and_trade_atomically() {
        let store = SqliteStore::open_in_memory().unwrap();
        let portfolio = Portfolio::new("acct", "paper", dec!(10000), "USD", MarginMode::Cross, dec!(1));
        store.save_portfolio(&portfolio).unwrap();

        let order = Order::new(
            portfolio.id,
            Symbol::new("BTC/USD"),
            Side::Buy,
            OrderType::Market,
            dec!(0.1),
            OrderParams::default(),
            dec!(1),
            MarginMode::Cross,
        );
        let position = Position::open(portfolio.id, Symbol::new("BTC/USD"), PositionSide::Long, dec!(30030), dec!(0.1), dec!(1), MarginMode::Cross);
        let trade = Trade::new(portfolio.id, order.id, Symbol::new("BTC/USD"), Side::Buy, dec!(30030), dec!(0.1), dec!(0.0005), false);

        store.commit_fill(&portfolio, &order, &[position], &trade).unwrap();

        assert_eq!(store.load_orders(portfolio.id).unwrap().len(), 1);
        assert_eq!(store.load_open_positions(portfolio.id).unwrap().len(), 1);
        assert_eq!(store.load_trades(portfolio.id).unwrap().len(), 1);
    }

    #[test]
    fn margin_block_can_be_saved_and_released() {
        let store = SqliteStore::open_in_memory().unwrap();
        let block = MarginBlock {
            id: 1,
            portfolio_id: PortfolioId(1),
            order_id: OrderId(1),
            symbol: Symbol::new("BTC/USD"),
            blocked_amount: dec!(100),
            created_at: Utc::now(),
            released_at: None,
        };
        store.save_margin_block(&block).unwrap();
        store.release_margin_block(1).unwrap();
    }

    #[test]
    fn reset_account_clears_history_and_rebases_balance() {
        let store = SqliteStore::open_in_memory().unwrap();
        let portfolio = Portfolio::new("acct", "paper", dec!(10000), "USD", MarginMode::Cross, dec!(1));
        store.save_portfolio(&portfolio).unwrap();
        let trade = Trade::new(portfolio.id, OrderId(1), Symbol::new("BTC/USD"), Side::Buy, dec!(100), dec!(1), dec!(0), false);
        store.insert_trade(&trade).unwrap();
        store
            .save_margin_block(&MarginBlock {
                id: 1,
                portfolio_id: portfolio.id,
                order_id: OrderId(1),
                symbol: Symbol::new("BTC/USD"),
                blocked_amount: dec!(100),
                created_at: Utc::now(),
                released_at: None,
            })
            .unwrap();

        store.reset_account(portfolio.id, dec!(5000)).unwrap();
        assert!(store.load_trades(portfolio.id).unwrap().is_empty());
        assert_eq!(store.load_portfolio(portfolio.id).unwrap().unwrap().current_balance, dec!(5000));

        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM margin_blocks WHERE portfolio_id = ?1",
                params![portfolio.id.0],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }
}
