use std::fmt;

use chrono::{NaiveDate, NaiveTime};

use crate::error::ClassifyError;
use crate::money::{Money, MoneySum};
use crate::parser::{LineItem, ParsedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PurchaseType {
    Vacuum,
    WashBay,
}

impl PurchaseType {
    /// Value stored in `Purchase.purchase_type`.
    pub fn code(self) -> &'static str {
        match self {
            PurchaseType::Vacuum => "V",
            PurchaseType::WashBay => "W",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "V" => Some(PurchaseType::Vacuum),
            "W" => Some(PurchaseType::WashBay),
            _ => None,
        }
    }
}

impl fmt::Display for PurchaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purchase {
    pub transaction_id: i64,
    pub purchase_date: NaiveDate,
    pub purchase_time: NaiveTime,
    pub cardholder_name: String,
    pub cardholder_last4: String,
    pub total_amount: Money,
    pub purchase_type: PurchaseType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumDetail {
    pub vacuum_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WashBayDetail {
    pub bay_number: u32,
    pub wash_purchase_total: Money,
}

/// Child rows of a purchase; the variant always matches `Purchase::purchase_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseDetails {
    Vacuum(VacuumDetail),
    WashBay(Vec<WashBayDetail>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub purchase: Purchase,
    pub details: PurchaseDetails,
}

pub fn classify(parsed: ParsedRecord) -> Result<Classified, ClassifyError> {
    let (purchase_type, details) = match parsed.type_token.as_str() {
        "V" => (PurchaseType::Vacuum, PurchaseDetails::Vacuum(vacuum_detail(&parsed)?)),
        "W" => (PurchaseType::WashBay, PurchaseDetails::WashBay(wash_bay_details(&parsed)?)),
        other => return Err(ClassifyError::UnknownTypeToken(other.to_string())),
    };

    Ok(Classified {
        purchase: Purchase {
            transaction_id: parsed.transaction_id,
            purchase_date: parsed.purchase_date,
            purchase_time: parsed.purchase_time,
            cardholder_name: parsed.cardholder_name,
            cardholder_last4: parsed.cardholder_last4,
            total_amount: parsed.total_amount,
            purchase_type,
        },
        details,
    })
}

fn positive(station: u32) -> Result<u32, ClassifyError> {
    if station == 0 {
        Err(ClassifyError::InvalidStation(station))
    } else {
        Ok(station)
    }
}

fn reject_foreign_lines(parsed: &ParsedRecord) -> Result<(), ClassifyError> {
    match parsed.line_items.iter().find(|line| line.token != parsed.type_token) {
        Some(line) => Err(ClassifyError::UnknownTypeToken(line.token.clone())),
        None => Ok(()),
    }
}

fn vacuum_detail(parsed: &ParsedRecord) -> Result<VacuumDetail, ClassifyError> {
    reject_foreign_lines(parsed)?;
    let station = match (parsed.station, parsed.line_items.as_slice()) {
        (Some(station), []) => station,
        (None, [line]) => line.station,
        (Some(station), [line]) if line.station == station => station,
        (None, []) => return Err(ClassifyError::MissingStation),
        // a vacuum purchase is one station; several lines cannot map to one row
        _ => return Err(ClassifyError::UnknownTypeToken(parsed.type_token.clone())),
    };
    Ok(VacuumDetail {
        vacuum_number: positive(station)?,
    })
}

fn wash_bay_details(parsed: &ParsedRecord) -> Result<Vec<WashBayDetail>, ClassifyError> {
    reject_foreign_lines(parsed)?;
    let total = &parsed.total_amount;

    let lines: &[LineItem] = &parsed.line_items;
    match lines {
        [] => {
            let bay = parsed.station.ok_or(ClassifyError::MissingStation)?;
            Ok(vec![WashBayDetail {
                bay_number: positive(bay)?,
                wash_purchase_total: total.clone(),
            }])
        }
        [line] if line.amount.is_none() => Ok(vec![WashBayDetail {
            bay_number: positive(line.station)?,
            wash_purchase_total: total.clone(),
        }]),
        _ => {
            let details = lines
                .iter()
                .map(|line| -> Result<WashBayDetail, ClassifyError> {
                    let amount = line
                        .amount
                        .clone()
                        .ok_or(ClassifyError::MissingLineAmount { bay: line.station })?;
                    Ok(WashBayDetail {
                        bay_number: positive(line.station)?,
                        wash_purchase_total: amount,
                    })
                })
                .collect::<Result<Vec<_>, ClassifyError>>()?;
            let sum: MoneySum = details.iter().map(|d| &d.wash_purchase_total).sum();
            if !sum.matches(total) {
                return Err(ClassifyError::reconciliation(total, &sum));
            }
            Ok(details)
        }
    }
}
