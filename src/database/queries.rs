use diesel::result::Error;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl, SelectableHelper, SqliteConnection};
use serde::Serialize;

use crate::classifier::{Classified, Purchase, PurchaseDetails, PurchaseType, VacuumDetail, WashBayDetail};
use crate::database::models;
use crate::money::Money;

#[derive(PartialEq, Eq, Debug, Default, Clone, Copy, Serialize)]
pub struct TableCounts {
    pub purchases: i64,
    pub vacuum_purchases: i64,
    pub wash_bay_purchases: i64,
}

pub fn purchase_exists(conn: &mut SqliteConnection, req_transaction_id: i64) -> Result<bool, Error> {
    use crate::schema::purchase::dsl::*;
    diesel::select(diesel::dsl::exists(purchase.filter(transaction_id.eq(req_transaction_id)))).get_result(conn)
}

// newest stored purchase; the portal lists newest first so fetching can stop there
pub fn latest_transaction_id(conn: &mut SqliteConnection) -> Result<Option<i64>, Error> {
    use crate::schema::purchase::dsl::*;
    purchase
        .select(transaction_id)
        .order((purchase_date.desc(), purchase_time.desc(), transaction_id.desc()))
        .first::<i64>(conn)
        .optional()
}

pub fn table_counts(conn: &mut SqliteConnection) -> Result<TableCounts, Error> {
    use crate::schema::{purchase, vacuum_purchase, wash_bay_purchase};
    Ok(TableCounts {
        purchases: purchase::table.count().get_result(conn)?,
        vacuum_purchases: vacuum_purchase::table.count().get_result(conn)?,
        wash_bay_purchases: wash_bay_purchase::table.count().get_result(conn)?,
    })
}

fn corrupt(reason: String) -> Error {
    Error::DeserializationError(reason.into())
}

fn money_column(value: f64, column: &str) -> Result<Money, Error> {
    Money::from_f64(value).map_err(|_| corrupt(format!("{column} holds invalid amount {value}")))
}

fn station_column(value: i32, column: &str) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| corrupt(format!("{column} holds invalid station {value}")))
}

/// Stored purchase with its child rows, decoded back into domain types.
pub fn load_purchase(conn: &mut SqliteConnection, req_transaction_id: i64) -> Result<Option<Classified>, Error> {
    let row = {
        use crate::schema::purchase::dsl::*;
        purchase
            .find(req_transaction_id)
            .select(models::PurchaseRow::as_select())
            .first(conn)
            .optional()?
    };
    let Some(row) = row else {
        return Ok(None);
    };

    let purchase_type = PurchaseType::from_code(&row.purchase_type)
        .ok_or_else(|| corrupt(format!("unknown purchase_type {:?}", row.purchase_type)))?;

    let details = match purchase_type {
        PurchaseType::Vacuum => {
            use crate::schema::vacuum_purchase::dsl::*;
            let vacuum = vacuum_purchase
                .find(req_transaction_id)
                .select(models::VacuumPurchaseRow::as_select())
                .first(conn)?;
            PurchaseDetails::Vacuum(VacuumDetail {
                vacuum_number: station_column(vacuum.vacuum_number, "vacuum_number")?,
            })
        }
        PurchaseType::WashBay => {
            use crate::schema::wash_bay_purchase::dsl::*;
            let lines = wash_bay_purchase
                .filter(transaction_id.eq(req_transaction_id))
                .order(line_id.asc())
                .select(models::WashBayLineRow::as_select())
                .load(conn)?;
            let lines = lines
                .into_iter()
                .map(|line| -> Result<WashBayDetail, Error> {
                    Ok(WashBayDetail {
                        bay_number: station_column(line.bay_number, "bay_number")?,
                        wash_purchase_total: money_column(line.wash_purchase_total, "wash_purchase_total")?,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            PurchaseDetails::WashBay(lines)
        }
    };

    Ok(Some(Classified {
        purchase: Purchase {
            transaction_id: row.transaction_id,
            purchase_date: row.purchase_date,
            purchase_time: row.purchase_time,
            cardholder_name: row.cardholder_name,
            cardholder_last4: row.cardholder_last4,
            total_amount: money_column(row.total_amount, "total_amount")?,
            purchase_type,
        },
        details,
    }))
}
