//! Recharge Engine: pending orders and idempotent payment confirmation.

use agent_market_core::{
    format_rfc3339, new_order_no, now_utc, LedgerEntryType, LedgerMutation, Lifecycle,
    MarketError, OrderId, OrderStatus, Page, PaymentMethod, PaymentNotice, PaymentOutcome,
    RechargeOrder, RechargeRequest, UserId,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::ledger::apply_mutation_in_tx;
use crate::{
    collect_rows, ensure_account_exists, is_unique_violation, parse_enum_column,
    parse_optional_time_column, parse_time_column, parse_ulid_column, parse_user_column,
    SqliteMarketStore, StorageContext, StoreResult,
};

const ORDER_COLUMNS: &str = "order_id, order_no, user_id, amount, points, payment_method,
     status, payment_id, paid_at, created_at, updated_at";

impl SqliteMarketStore {
    /// Persists a `pending` order. No balance effect until payment confirms.
    pub fn create_order(
        &mut self,
        user_id: &UserId,
        request: RechargeRequest,
        payment_method: PaymentMethod,
    ) -> StoreResult<RechargeOrder> {
        self.create_order_with_no(user_id, request, payment_method, new_order_no())
    }

    pub(crate) fn create_order_with_no(
        &mut self,
        user_id: &UserId,
        request: RechargeRequest,
        payment_method: PaymentMethod,
        order_no: String,
    ) -> StoreResult<RechargeOrder> {
        let (amount, points) = request.resolve()?;
        let now = now_utc();
        let now_raw = format_rfc3339(now)?;
        let order = RechargeOrder {
            order_id: OrderId::new(),
            order_no,
            user_id: user_id.clone(),
            amount,
            points,
            payment_method,
            status: OrderStatus::Pending,
            payment_id: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.begin_write()?;
        ensure_account_exists(&tx, user_id)?;
        tx.execute(
            "INSERT INTO recharge_orders(
                order_id, order_no, user_id, amount, points, payment_method,
                status, payment_id, paid_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL, NULL, ?7, ?7)",
            params![
                order.order_id.to_string(),
                order.order_no,
                user_id.as_str(),
                amount,
                points,
                payment_method.as_str(),
                now_raw,
            ],
        )
        .map_err(|err| {
            if is_unique_violation(&err) {
                MarketError::Integrity(format!("order_no collision: {}", order.order_no))
            } else {
                MarketError::Internal(format!("failed to insert recharge order: {err}"))
            }
        })?;
        tx.commit().storage("failed to commit recharge order")?;

        info!(
            user_id = %user_id,
            order_no = %order.order_no,
            amount,
            points,
            payment_method = %payment_method,
            "recharge order created"
        );
        Ok(order)
    }

    /// Applies a verified payment signal to its order.
    ///
    /// Safe to call any number of times: once the order has left `pending`
    /// the stored order is returned unchanged. An amount mismatch leaves the
    /// order `pending` so a corrected notice can still settle it.
    pub fn confirm_payment(&mut self, notice: &PaymentNotice) -> StoreResult<RechargeOrder> {
        let outcome = notice.outcome()?;
        let order_no = notice.order_no.trim();

        let tx = self.begin_write()?;
        let order = select_order_by_no(&tx, order_no)?
            .ok_or_else(|| MarketError::NotFound(format!("recharge order {order_no}")))?;

        if order.status != OrderStatus::Pending {
            info!(
                order_no = %order.order_no,
                status = %order.status,
                "payment notice for settled order ignored"
            );
            return Ok(order);
        }

        if notice.amount != order.amount {
            warn!(
                order_no = %order.order_no,
                expected = order.amount,
                received = notice.amount,
                "payment amount mismatch"
            );
            return Err(MarketError::AmountMismatch {
                expected: order.amount,
                received: notice.amount,
            });
        }

        let next = outcome.order_status();
        order.status.ensure_transition(next)?;

        let now = format_rfc3339(now_utc())?;
        let payment_id = Some(notice.payment_id.trim()).filter(|value| !value.is_empty());
        let paid_at = (outcome == PaymentOutcome::Paid).then_some(now.as_str());
        let updated = tx
            .execute(
                "UPDATE recharge_orders
                 SET status = ?2, payment_id = ?3, paid_at = ?4, updated_at = ?5
                 WHERE order_id = ?1 AND status = 'pending'",
                params![
                    order.order_id.to_string(),
                    next.as_str(),
                    payment_id,
                    paid_at,
                    now
                ],
            )
            .storage("failed to settle recharge order")?;
        if updated != 1 {
            return Err(MarketError::Internal(format!(
                "recharge order {} changed during settlement",
                order.order_no
            )));
        }

        if outcome == PaymentOutcome::Paid {
            apply_mutation_in_tx(
                &tx,
                &LedgerMutation {
                    user_id: order.user_id.clone(),
                    entry_type: LedgerEntryType::Recharge,
                    amount: order.points,
                    description: format!("recharge: order {}", order.order_no),
                    related_id: Some(order.order_id.to_string()),
                },
            )?;
        }

        let settled = select_order_by_no(&tx, order_no)?.ok_or_else(|| {
            MarketError::Internal(format!("recharge order {order_no} vanished"))
        })?;
        tx.commit().storage("failed to commit payment confirmation")?;

        info!(
            user_id = %settled.user_id,
            order_no = %settled.order_no,
            status = %settled.status,
            points = settled.points,
            "recharge order settled"
        );
        Ok(settled)
    }

    pub fn get_order(&self, user_id: &UserId, order_id: OrderId) -> StoreResult<RechargeOrder> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM recharge_orders WHERE order_id = ?1");
        self.conn
            .query_row(&query, params![order_id.to_string()], parse_order_row)
            .optional()
            .storage("failed to load recharge order")?
            .filter(|order| &order.user_id == user_id)
            .ok_or_else(|| MarketError::NotFound(format!("recharge order {order_id}")))
    }

    pub fn get_order_by_no(&self, order_no: &str) -> StoreResult<RechargeOrder> {
        select_order_by_no(&self.conn, order_no.trim())?
            .ok_or_else(|| MarketError::NotFound(format!("recharge order {order_no}")))
    }

    pub fn list_orders(
        &self,
        user_id: &UserId,
        status: Option<OrderStatus>,
        page: Page,
    ) -> StoreResult<Vec<RechargeOrder>> {
        let query = format!(
            "SELECT {ORDER_COLUMNS}
             FROM recharge_orders
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, order_id DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare order listing")?;
        let rows = stmt
            .query_map(
                params![
                    user_id.as_str(),
                    status.map(OrderStatus::as_str),
                    i64::from(page.limit),
                    i64::from(page.offset)
                ],
                parse_order_row,
            )
            .storage("failed to list recharge orders")?;
        collect_rows(rows)
    }
}

fn select_order_by_no(conn: &Connection, order_no: &str) -> StoreResult<Option<RechargeOrder>> {
    let query = format!("SELECT {ORDER_COLUMNS} FROM recharge_orders WHERE order_no = ?1");
    conn.query_row(&query, params![order_no], parse_order_row)
        .optional()
        .storage("failed to load recharge order")
}

fn parse_order_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RechargeOrder> {
    Ok(RechargeOrder {
        order_id: OrderId(parse_ulid_column(row, 0)?),
        order_no: row.get(1)?,
        user_id: parse_user_column(row, 2)?,
        amount: row.get(3)?,
        points: row.get(4)?,
        payment_method: parse_enum_column(row, 5, "payment_method", PaymentMethod::parse)?,
        status: parse_enum_column(row, 6, "order status", OrderStatus::parse)?,
        payment_id: row.get(7)?,
        paid_at: parse_optional_time_column(row, 8)?,
        created_at: parse_time_column(row, 9)?,
        updated_at: parse_time_column(row, 10)?,
    })
}
