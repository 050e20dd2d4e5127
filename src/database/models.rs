use chrono::{NaiveDate, NaiveTime};
use diesel::prelude::*;

use crate::schema::{purchase, vacuum_purchase, wash_bay_purchase};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = purchase)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PurchaseRow {
    pub transaction_id: i64,
    pub purchase_date: NaiveDate,
    pub purchase_time: NaiveTime,
    pub cardholder_name: String,
    pub cardholder_last4: String,
    pub total_amount: f64,
    pub purchase_type: String,
}

#[derive(Insertable)]
#[diesel(table_name = purchase)]
pub struct NewPurchase<'a> {
    pub transaction_id: i64,
    pub purchase_date: NaiveDate,
    pub purchase_time: NaiveTime,
    pub cardholder_name: &'a str,
    pub cardholder_last4: &'a str,
    pub total_amount: f64,
    pub purchase_type: &'a str,
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = vacuum_purchase)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VacuumPurchaseRow {
    pub transaction_id: i64,
    pub vacuum_number: i32,
}

/// Bay line as read back for a purchase; rows come ordered by `line_id`.
#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = wash_bay_purchase)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WashBayLineRow {
    pub bay_number: i32,
    pub wash_purchase_total: f64,
}

#[derive(Insertable)]
#[diesel(table_name = wash_bay_purchase)]
pub struct NewWashBayPurchase {
    pub transaction_id: i64,
    pub bay_number: i32,
    pub wash_purchase_total: f64,
}
