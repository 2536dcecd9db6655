//! The built-in record types of the fish farm workbook.
//!
//! Each record type names its destination table, its target schema and the
//! worksheet it is read from by default. Header aliases cover the labels the
//! farm sheets actually use ("Timestamp", "Feed Eaten (gram)", "Supplier").

use std::fmt;
use std::str::FromStr;

use crate::constants::{
    BATCH, DAILY_RECORD, EXPENSE, INVENTORY_ITEM, KPI_TARGET, POND, POND_BATCH_ASSIGNMENT,
    WATER_RECORD, WEEKLY_CHECK,
};
use crate::error::EtlError;
use crate::pipeline::schema::{FieldSchema, RowRule, TableSchema};
use crate::source::WorksheetSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    Pond,
    Batch,
    PondBatchAssignment,
    DailyRecord,
    WeeklyCheck,
    WaterRecord,
    InventoryItem,
    Expense,
    KpiTarget,
}

impl RecordType {
    /// Every record type, reference tables first.
    pub const ALL: [RecordType; 9] = [
        RecordType::Pond,
        RecordType::Batch,
        RecordType::PondBatchAssignment,
        RecordType::DailyRecord,
        RecordType::WeeklyCheck,
        RecordType::WaterRecord,
        RecordType::InventoryItem,
        RecordType::Expense,
        RecordType::KpiTarget,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RecordType::Pond => POND,
            RecordType::Batch => BATCH,
            RecordType::PondBatchAssignment => POND_BATCH_ASSIGNMENT,
            RecordType::DailyRecord => DAILY_RECORD,
            RecordType::WeeklyCheck => WEEKLY_CHECK,
            RecordType::WaterRecord => WATER_RECORD,
            RecordType::InventoryItem => INVENTORY_ITEM,
            RecordType::Expense => EXPENSE,
            RecordType::KpiTarget => KPI_TARGET,
        }
    }

    /// Reference tables other record types point at. They load before the rest.
    pub fn is_reference(&self) -> bool {
        matches!(self, RecordType::Pond | RecordType::Batch)
    }

    pub fn default_worksheet(&self) -> WorksheetSelector {
        match self {
            RecordType::Pond => WorksheetSelector::Name("Ponds".to_string()),
            RecordType::Batch => WorksheetSelector::Name("Batches".to_string()),
            RecordType::PondBatchAssignment => {
                WorksheetSelector::Name("Pond Batch Assignments".to_string())
            }
            RecordType::DailyRecord => WorksheetSelector::Index(6),
            RecordType::WeeklyCheck => WorksheetSelector::Index(12),
            RecordType::WaterRecord => WorksheetSelector::Index(7),
            RecordType::InventoryItem => WorksheetSelector::Index(2),
            RecordType::Expense => WorksheetSelector::Index(4),
            RecordType::KpiTarget => WorksheetSelector::Index(14),
        }
    }

    pub fn schema(&self) -> TableSchema {
        match self {
            RecordType::Pond => TableSchema::new(
                POND,
                vec![
                    FieldSchema::text("name")
                        .required()
                        .aliases(&["pond", "pond_name", "pond_id"])
                        .max_len(100),
                    FieldSchema::integer("capacity", Some(1), None),
                    FieldSchema::enumeration("status", &["occupied", "emptied"])
                        .default_value("occupied"),
                    FieldSchema::text("location"),
                ],
                &["name"],
            ),

            RecordType::Batch => TableSchema::new(
                BATCH,
                vec![
                    FieldSchema::text("name")
                        .required()
                        .aliases(&["batch", "batch_name", "batch_id"])
                        .max_len(100),
                    FieldSchema::date("stock_date")
                        .required()
                        .aliases(&["stocking_date", "date_stocked"]),
                    FieldSchema::date("predicted_harvest")
                        .aliases(&["expected_harvest", "harvest_date"]),
                    FieldSchema::integer("initial_count", Some(0), None)
                        .aliases(&["stock_count", "number_stocked"]),
                    FieldSchema::decimal("initial_average", Some(0.0), None)
                        .aliases(&["initial_average_weight", "initial_avg_weight"]),
                    FieldSchema::enumeration("status", &["active", "completed", "harvested"])
                        .default_value("active"),
                ],
                &["name"],
            )
            .with_rule(RowRule::NotBefore {
                field: "predicted_harvest".to_string(),
                reference: "stock_date".to_string(),
            }),

            RecordType::PondBatchAssignment => TableSchema::new(
                POND_BATCH_ASSIGNMENT,
                vec![
                    pond_reference().required(),
                    batch_reference().required(),
                    FieldSchema::date("start_date").required(),
                    FieldSchema::date("end_date"),
                ],
                &["pond", "batch", "start_date"],
            )
            .with_rule(RowRule::NotBefore {
                field: "end_date".to_string(),
                reference: "start_date".to_string(),
            }),

            RecordType::DailyRecord => TableSchema::new(
                DAILY_RECORD,
                vec![
                    FieldSchema::date("record_date")
                        .required()
                        .aliases(&["timestamp", "date", "record_timestamp"]),
                    pond_reference().required(),
                    batch_reference(),
                    FieldSchema::decimal("temperature", None, None)
                        .aliases(&["water_temp", "temperature_c"]),
                    FieldSchema::decimal("feed_eaten", Some(0.0), None)
                        .aliases(&["feed_eaten_gram", "feed_eaten_grams"])
                        .scale(2),
                    FieldSchema::enumeration("feed_size", &["2mm", "3mm", "4mm", "6mm", "9mm"]),
                    FieldSchema::integer("mortality", Some(0), None),
                    FieldSchema::enumeration("fish_behaviour", &["active", "inactive"])
                        .aliases(&["fish_behavior", "behaviour"]),
                    FieldSchema::text("notes").aliases(&["note", "remarks"]),
                ],
                &["pond", "batch", "record_date"],
            ),

            RecordType::WeeklyCheck => TableSchema::new(
                WEEKLY_CHECK,
                vec![
                    batch_reference().required(),
                    FieldSchema::integer("week_no", Some(0), None)
                        .required()
                        .aliases(&["week", "week_number"]),
                    FieldSchema::date("record_date").aliases(&["timestamp", "date"]),
                    pond_reference(),
                    FieldSchema::decimal("average_weight", Some(0.0), None)
                        .aliases(&["avg_weight", "average_weight_g"]),
                    FieldSchema::decimal("sgr", None, None),
                    FieldSchema::decimal("fcr", Some(0.0), None),
                    FieldSchema::decimal("biomass", Some(0.0), None).aliases(&["biomas"]),
                    FieldSchema::text("notes").aliases(&["note"]),
                ],
                &["batch", "week_no"],
            ),

            RecordType::WaterRecord => TableSchema::new(
                WATER_RECORD,
                vec![
                    pond_reference().required(),
                    FieldSchema::timestamp("record_timestamp")
                        .required()
                        .aliases(&["timestamp", "record_date", "date"]),
                    FieldSchema::decimal("temperature", Some(20.0), Some(40.0))
                        .aliases(&["water_temperature", "water_temp"]),
                    FieldSchema::decimal("ph", Some(5.0), Some(10.0)).aliases(&["p_h", "ph_level"]),
                    FieldSchema::decimal("ammonia", Some(0.0), None),
                    FieldSchema::decimal("dissolved_oxygen", Some(0.0), None).aliases(&["do"]),
                    FieldSchema::decimal("nitrite", Some(0.0), None),
                    FieldSchema::decimal("nitrate", Some(0.0), None),
                    FieldSchema::text("notes").aliases(&["note", "water_change"]),
                ],
                &["pond", "record_timestamp"],
            ),

            RecordType::InventoryItem => TableSchema::new(
                INVENTORY_ITEM,
                vec![
                    FieldSchema::text("name").required().aliases(&["item", "item_name"]),
                    FieldSchema::enumeration(
                        "category",
                        &["feed", "medication", "equipment", "unknown"],
                    )
                    .default_value("unknown"),
                    FieldSchema::decimal("quantity", Some(0.0), None)
                        .aliases(&["stock_quantity", "qty"]),
                    FieldSchema::text("unit"),
                    FieldSchema::decimal("cost", Some(0.0), None)
                        .aliases(&["cost_per_item", "unit_cost"])
                        .scale(2),
                    FieldSchema::text("manufacturer"),
                    FieldSchema::date("date_purchased").aliases(&["purchase_date"]),
                ],
                &["name"],
            ),

            RecordType::Expense => TableSchema::new(
                EXPENSE,
                vec![
                    FieldSchema::date("purchase_date")
                        .required()
                        .aliases(&["timestamp", "date", "record_date"]),
                    FieldSchema::enumeration(
                        "category",
                        &["feed", "fuel", "labour", "medication", "fish", "transport", "others"],
                    )
                    .default_value("others"),
                    FieldSchema::text("item").required(),
                    FieldSchema::text("vendor").aliases(&["supplier"]),
                    FieldSchema::text("description"),
                    FieldSchema::decimal("quantity", Some(0.0), None),
                    FieldSchema::decimal("cost", Some(0.0), None)
                        .required()
                        .aliases(&["amount", "total_cost"])
                        .scale(2),
                    batch_reference(),
                ],
                &["purchase_date", "item", "vendor"],
            ),

            RecordType::KpiTarget => TableSchema::new(
                KPI_TARGET,
                vec![
                    batch_reference().required(),
                    FieldSchema::date("record_date")
                        .required()
                        .aliases(&["timestamp", "date"]),
                    FieldSchema::decimal("average_weight", Some(0.0), None)
                        .aliases(&["target_avg_weight", "target_average_weight"]),
                    FieldSchema::decimal("target_biomass", Some(0.0), None),
                    FieldSchema::decimal("weekly_gain", None, None)
                        .aliases(&["target_weekly_gain"]),
                    FieldSchema::text("notes"),
                ],
                &["batch", "record_date"],
            ),
        }
    }
}

fn pond_reference() -> FieldSchema {
    FieldSchema::reference("pond", POND, "name").aliases(&["pond_id", "pond_name"])
}

fn batch_reference() -> FieldSchema {
    FieldSchema::reference("batch", BATCH, "name").aliases(&["batch_id", "batch_name"])
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecordType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        RecordType::ALL
            .into_iter()
            .find(|r| r.name() == wanted)
            .ok_or_else(|| {
                EtlError::Config(format!(
                    "unknown pipeline '{s}' (known: {})",
                    RecordType::ALL.map(|r| r.name()).join(", ")
                ))
            })
    }
}
