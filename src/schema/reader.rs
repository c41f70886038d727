//! CSV table reading with header validation

use crate::error::{MetricsError, MetricsResult};
use crate::schema::tables::{
    MergedCashFeeRow, MonthlyActiveUsersRow, TableSchema, TransferTypeShareRow,
    UserFirstRequestRow,
};
use csv::StringRecord;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Reader for schema-checked CSV tables
pub struct TableReader;

impl TableReader {
    /// Read every row of a table, checking the header against the contract first
    pub fn read<T, R>(reader: R) -> MetricsResult<Vec<T>>
    where
        T: TableSchema + DeserializeOwned,
        R: Read,
    {
        let mut csv_rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers = csv_rdr.headers()?.clone();
        Self::check_columns::<T>(&headers)?;

        let mut rows = Vec::new();
        for result in csv_rdr.deserialize::<T>() {
            rows.push(result.map_err(|e| schema_error(T::TABLE, e))?);
        }

        log::debug!("Read {} rows from table '{}'", rows.len(), T::TABLE);
        Ok(rows)
    }

    /// Read a table from an in-memory CSV string
    pub fn read_str<T>(data: &str) -> MetricsResult<Vec<T>>
    where
        T: TableSchema + DeserializeOwned,
    {
        Self::read(data.as_bytes())
    }

    /// Read a table from a file
    pub fn read_file<T>(path: &Path) -> MetricsResult<Vec<T>>
    where
        T: TableSchema + DeserializeOwned,
    {
        let file = File::open(path)?;
        Self::read(BufReader::with_capacity(64 * 1024, file))
    }

    /// Fail with the first required column missing from `headers`
    pub fn check_columns<T: TableSchema>(headers: &StringRecord) -> MetricsResult<()> {
        for column in T::REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == *column) {
                return Err(MetricsError::MissingColumn {
                    table: T::TABLE,
                    column: (*column).to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Map a CSV error into the schema class unless it is an I/O failure
fn schema_error(table: &'static str, err: csv::Error) -> MetricsError {
    if matches!(err.kind(), csv::ErrorKind::Io(_)) {
        return MetricsError::Csv(err);
    }
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    MetricsError::InvalidValue {
        table,
        line,
        message: err.to_string(),
    }
}

/// The four tables the metrics pipeline consumes
#[derive(Debug, Clone, Default)]
pub struct InputTables {
    pub user_first_request: Vec<UserFirstRequestRow>,
    pub monthly_active_users: Vec<MonthlyActiveUsersRow>,
    pub transfer_type_share: Vec<TransferTypeShareRow>,
    pub merged_cash_fee: Vec<MergedCashFeeRow>,
}

impl InputTables {
    /// Load all four tables from their conventional file names in `dir`
    pub fn load_dir(dir: &Path) -> MetricsResult<Self> {
        let tables = Self {
            user_first_request: TableReader::read_file(&dir.join(UserFirstRequestRow::FILE_NAME))?,
            monthly_active_users: TableReader::read_file(
                &dir.join(MonthlyActiveUsersRow::FILE_NAME),
            )?,
            transfer_type_share: TableReader::read_file(&dir.join(TransferTypeShareRow::FILE_NAME))?,
            merged_cash_fee: TableReader::read_file(&dir.join(MergedCashFeeRow::FILE_NAME))?,
        };

        log::info!(
            "Loaded input tables from {}: {} users, {} merged rows",
            dir.display(),
            tables.user_first_request.len(),
            tables.merged_cash_fee.len()
        );
        Ok(tables)
    }

    /// Load all four tables from in-memory CSV text
    pub fn from_csv_strs(
        user_first_request: &str,
        monthly_active_users: &str,
        transfer_type_share: &str,
        merged_cash_fee: &str,
    ) -> MetricsResult<Self> {
        Ok(Self {
            user_first_request: TableReader::read_str(user_first_request)?,
            monthly_active_users: TableReader::read_str(monthly_active_users)?,
            transfer_type_share: TableReader::read_str(transfer_type_share)?,
            merged_cash_fee: TableReader::read_str(merged_cash_fee)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CashStatus, FeeType, TransferType};

    const MERGED_HEADER: &str = "cash_request_id,final_user_id,amount,cash_status,transfer_type,cash_created_at,recovery_status,fee_id,total_amount,type,fee_status,fee_created_at";

    #[test]
    fn test_read_merged_rows() {
        let csv = format!(
            "{}\n\
             5,804.0,100.0,money_back,regular,2019-12-10 19:05:21.596873+00,,,,,,\n\
             70,3.0,50.0,rejected,instant,2020-06-01 10:00:00,Completed ,3001.0,5.0,instant_payment,Accepted,2020-06-02 09:00:00\n",
            MERGED_HEADER
        );

        let rows: Vec<MergedCashFeeRow> = TableReader::read_str(&csv).unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].final_user_id, "804");
        assert_eq!(rows[0].cash_status, CashStatus::MoneyBack);
        assert_eq!(rows[0].transfer_type, TransferType::Regular);
        assert_eq!(rows[0].recovery_status, None);
        assert_eq!(rows[0].fee_id, None);
        assert_eq!(rows[0].fee_created_at, None);

        assert_eq!(rows[1].recovery_status.as_deref(), Some("completed"));
        assert_eq!(rows[1].fee_id.as_deref(), Some("3001"));
        assert_eq!(rows[1].fee_type, Some(FeeType::InstantPayment));
        assert_eq!(rows[1].fee_status.as_deref(), Some("accepted"));
        assert_eq!(rows[1].total_amount, Some(5.0));
    }

    #[test]
    fn test_missing_column_fails_fast() {
        let csv = "final_user_id,first_request_date\n1,2020-01-01\n";
        let result: MetricsResult<Vec<UserFirstRequestRow>> = TableReader::read_str(csv);

        match result {
            Err(MetricsError::MissingColumn { table, column }) => {
                assert_eq!(table, "user_first_request");
                assert_eq!(column, "cohort_year_month");
            }
            other => panic!("expected missing column error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_value_reports_table_and_line() {
        let csv = "activity_month,active_users\n2020-01,10\n2020-02,many\n";
        let result: MetricsResult<Vec<MonthlyActiveUsersRow>> = TableReader::read_str(csv);

        match result {
            Err(MetricsError::InvalidValue { table, line, .. }) => {
                assert_eq!(table, "monthly_active_users");
                assert_eq!(line, 3);
            }
            other => panic!("expected invalid value error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_transfer_type_is_schema_error() {
        let csv = format!(
            "{}\n1,1,10.0,pending,carrier_pigeon,2020-01-01,,,,,,\n",
            MERGED_HEADER
        );
        let result: MetricsResult<Vec<MergedCashFeeRow>> = TableReader::read_str(&csv);
        assert!(result.unwrap_err().is_schema_error());
    }
}
