//! Reference tools.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use rok_contracts::error::{RokError, RokResult};
use rok_core::traits::{ToolInterface, ToolResponse};

pub const CALCULATOR: &str = "calculator";

fn tool_error(reason: impl Into<String>) -> RokError {
    RokError::ExecutorFailure {
        executor: CALCULATOR.to_string(),
        reason: reason.into(),
    }
}

/// Monthly payment of an amortized loan, rounded to cents.
///
/// `payment = P * i * (1 + i)^n / ((1 + i)^n - 1)` with `i = annual_rate / 12`.
/// A zero rate divides the principal evenly.
pub fn amortized_payment(principal: f64, annual_rate: f64, months: u32) -> RokResult<f64> {
    if principal.is_nan() || principal <= 0.0 {
        return Err(tool_error("principal must be positive"));
    }
    if annual_rate.is_nan() || annual_rate < 0.0 {
        return Err(tool_error("annual rate cannot be negative"));
    }
    if months == 0 {
        return Err(tool_error("months must be positive"));
    }
    let monthly = annual_rate / 12.0;
    let payment = if monthly == 0.0 {
        principal / f64::from(months)
    } else {
        let factor = (1.0 + monthly).powi(months as i32);
        principal * monthly * factor / (factor - 1.0)
    };
    Ok((payment * 100.0).round() / 100.0)
}

/// The `calculator` tool. Reads `principal`, `annual_rate`, and `months`
/// from its config.
#[derive(Debug, Clone, Default)]
pub struct CalculatorTool;

impl CalculatorTool {
    fn field(config: &serde_json::Value, name: &str) -> RokResult<f64> {
        config
            .get(name)
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| tool_error(format!("missing numeric input '{name}'")))
    }
}

#[async_trait]
impl ToolInterface for CalculatorTool {
    async fn invoke(&self, tool_name: &str, config: &serde_json::Value) -> RokResult<ToolResponse> {
        if tool_name != CALCULATOR {
            return Err(RokError::ExecutorFailure {
                executor: tool_name.to_string(),
                reason: "unknown tool".to_string(),
            });
        }
        let principal = Self::field(config, "principal")?;
        let annual_rate = Self::field(config, "annual_rate")?;
        let months = Self::field(config, "months")?;
        if months.fract() != 0.0 || months < 0.0 || months > f64::from(u32::MAX) {
            return Err(tool_error("months must be a whole number"));
        }
        let months = months as u32;

        let payment = amortized_payment(principal, annual_rate, months)?;
        let display = format!("${payment:.2}");
        debug!(principal, annual_rate, months, payment, "calculated amortized payment");
        Ok(ToolResponse {
            output: display.clone(),
            data: Some(json!({
                "monthly_payment_value": payment,
                "monthly_payment_display": display,
            })),
            tool_call_ref: format!("{CALCULATOR}/amortized/{principal}/{annual_rate}/{months}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amortized_payment() {
        assert_eq!(amortized_payment(10_000.0, 0.05, 36).unwrap(), 299.71);
        assert_eq!(amortized_payment(250_000.0, 0.07, 360).unwrap(), 1663.26);
    }

    #[test]
    fn test_zero_rate_divides_evenly() {
        assert_eq!(amortized_payment(12_000.0, 0.0, 24).unwrap(), 500.0);
    }

    #[test]
    fn test_invalid_inputs_are_executor_failures() {
        assert!(amortized_payment(0.0, 0.05, 12).unwrap_err().is_executor_failure());
        assert!(amortized_payment(1000.0, -0.01, 12).is_err());
        assert!(amortized_payment(1000.0, 0.05, 0).is_err());
    }

    #[tokio::test]
    async fn test_tool_response_renders_dollars() {
        let config = json!({ "principal": 10000, "annual_rate": 0.05, "months": 36 });
        let response = CalculatorTool.invoke(CALCULATOR, &config).await.unwrap();
        assert_eq!(response.output, "$299.71");
        assert_eq!(response.data.unwrap()["monthly_payment_value"], 299.71);
        assert_eq!(response.tool_call_ref, "calculator/amortized/10000/0.05/36");
    }

    #[tokio::test]
    async fn test_missing_input_is_reported() {
        let err = CalculatorTool
            .invoke(CALCULATOR, &json!({ "principal": 10000 }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("annual_rate"), "unexpected error: {err}");
    }
}
