use diesel::result::Error;
use diesel::{Connection, RunQueryDsl, SqliteConnection};
use tracing::{debug, instrument, warn};

use crate::classifier::{Purchase, PurchaseDetails, PurchaseType};
use crate::database::models::{NewPurchase, NewWashBayPurchase, VacuumPurchaseRow};
use crate::database::queries;
use crate::error::LoadError;
use crate::schema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResult {
    Inserted,
    /// The transaction id was already stored; nothing was written.
    Skipped,
    Failed(LoadError),
}

fn station(value: u32) -> Result<i32, Error> {
    i32::try_from(value).map_err(|e| Error::SerializationError(Box::new(e)))
}

fn invariant(reason: &str) -> Error {
    Error::QueryBuilderError(reason.to_string().into())
}

/// Insert-if-absent of a purchase and its child rows.
#[instrument(skip_all, fields(transaction_id = purchase.transaction_id))]
pub fn load(conn: &mut SqliteConnection, purchase: &Purchase, details: &PurchaseDetails) -> LoadResult {
    match insert_purchase(conn, purchase, details) {
        Ok(true) => {
            debug!("purchase inserted");
            LoadResult::Inserted
        }
        Ok(false) => {
            debug!("purchase already stored, skipped");
            LoadResult::Skipped
        }
        Err(e) => {
            warn!("purchase rolled back: {e}");
            LoadResult::Failed(LoadError {
                transaction_id: purchase.transaction_id,
                reason: e.to_string(),
            })
        }
    }
}

// one sqlite transaction: either the purchase and all its child rows land, or nothing does
fn insert_purchase(conn: &mut SqliteConnection, purchase: &Purchase, details: &PurchaseDetails) -> Result<bool, Error> {
    conn.transaction::<_, Error, _>(|conn| {
        // idempotency check
        if queries::purchase_exists(conn, purchase.transaction_id)? {
            return Ok(false);
        }
        match (purchase.purchase_type, details) {
            (PurchaseType::Vacuum, PurchaseDetails::Vacuum(_)) => {}
            (PurchaseType::WashBay, PurchaseDetails::WashBay(lines)) if !lines.is_empty() => {}
            (PurchaseType::WashBay, PurchaseDetails::WashBay(_)) => {
                return Err(invariant("wash bay purchase without bay lines"));
            }
            _ => return Err(invariant("purchase type does not match its detail rows")),
        }

        {
            let new_purchase = NewPurchase {
                transaction_id: purchase.transaction_id,
                purchase_date: purchase.purchase_date,
                purchase_time: purchase.purchase_time,
                cardholder_name: &purchase.cardholder_name,
                cardholder_last4: &purchase.cardholder_last4,
                total_amount: purchase.total_amount.to_f64(),
                purchase_type: purchase.purchase_type.code(),
            };
            diesel::insert_into(schema::purchase::table).values(&new_purchase).execute(conn)?;
        }

        match details {
            PurchaseDetails::Vacuum(vacuum) => {
                let row = VacuumPurchaseRow {
                    transaction_id: purchase.transaction_id,
                    vacuum_number: station(vacuum.vacuum_number)?,
                };
                diesel::insert_into(schema::vacuum_purchase::table).values(&row).execute(conn)?;
            }
            PurchaseDetails::WashBay(lines) => {
                let rows = lines
                    .iter()
                    .map(|line| -> Result<NewWashBayPurchase, Error> {
                        Ok(NewWashBayPurchase {
                            transaction_id: purchase.transaction_id,
                            bay_number: station(line.bay_number)?,
                            wash_purchase_total: line.wash_purchase_total.to_f64(),
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                diesel::insert_into(schema::wash_bay_purchase::table).values(&rows).execute(conn)?;
            }
        }

        Ok(true)
    })
}
