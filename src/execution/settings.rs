//! Per-query execution options and the session statements they imply.

use crate::config::QueryExecutionSettings;
use crate::database::DbColumn;
use serde::{Deserialize, Serialize};

/// Execution plan capture requested with an execute call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionPlanOptions {
    /// Return the estimated plan instead of running the statements
    pub include_estimated_execution_plan_xml: bool,

    /// Run the statements and return the actual plan alongside the results
    pub include_actual_execution_plan_xml: bool,
}

/// Everything a query needs to know about how to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub settings: QueryExecutionSettings,
    pub plan: ExecutionPlanOptions,
}

impl QueryOptions {
    pub fn new(settings: QueryExecutionSettings, plan: ExecutionPlanOptions) -> Self {
        Self { settings, plan }
    }

    /// Statements run on the connection before the first batch.
    pub fn setup_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        if self.settings.row_count > 0 {
            statements.push(format!("SET ROWCOUNT {}", self.settings.row_count));
        }
        if self.plan.include_estimated_execution_plan_xml {
            statements.push("SET SHOWPLAN_XML ON".to_string());
        } else if self.plan.include_actual_execution_plan_xml {
            statements.push("SET STATISTICS XML ON".to_string());
        }
        statements
    }

    /// Statements that undo `setup_statements`, in reverse order.
    pub fn teardown_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        if self.plan.include_estimated_execution_plan_xml {
            statements.push("SET SHOWPLAN_XML OFF".to_string());
        } else if self.plan.include_actual_execution_plan_xml {
            statements.push("SET STATISTICS XML OFF".to_string());
        }
        if self.settings.row_count > 0 {
            statements.push("SET ROWCOUNT 0".to_string());
        }
        statements
    }

    /// Character limit applied to cells of `column`.
    pub fn char_limit(&self, column: &DbColumn) -> usize {
        if column.is_xml() {
            self.settings.max_xml_chars_to_store
        } else {
            self.settings.max_chars_to_store
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_session_statements_by_default() {
        let options = QueryOptions::default();
        assert!(options.setup_statements().is_empty());
        assert!(options.teardown_statements().is_empty());
    }

    #[test]
    fn test_row_count_and_actual_plan() {
        let options = QueryOptions::new(
            QueryExecutionSettings {
                row_count: 50,
                ..Default::default()
            },
            ExecutionPlanOptions {
                include_actual_execution_plan_xml: true,
                ..Default::default()
            },
        );
        assert_eq!(
            options.setup_statements(),
            vec!["SET ROWCOUNT 50", "SET STATISTICS XML ON"]
        );
        assert_eq!(
            options.teardown_statements(),
            vec!["SET STATISTICS XML OFF", "SET ROWCOUNT 0"]
        );
    }

    #[test]
    fn test_estimated_plan_wins() {
        let options = QueryOptions::new(
            QueryExecutionSettings::default(),
            ExecutionPlanOptions {
                include_estimated_execution_plan_xml: true,
                include_actual_execution_plan_xml: true,
            },
        );
        assert_eq!(options.setup_statements(), vec!["SET SHOWPLAN_XML ON"]);
    }

    #[test]
    fn test_char_limits() {
        let options = QueryOptions::default();
        assert_eq!(
            options.char_limit(&DbColumn::new("x", 0, "XML")),
            options.settings.max_xml_chars_to_store
        );
        assert_eq!(
            options.char_limit(&DbColumn::new("x", 0, "NVARCHAR")),
            options.settings.max_chars_to_store
        );
    }
}
