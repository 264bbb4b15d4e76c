//! Built-in tools personalities can bind.
//!
//! The library is assembled at startup; packs select tools by name in
//! their manifest. Both built-ins are deterministic and offline so the
//! runtime can be exercised end-to-end without network access.

use async_trait::async_trait;
use std::sync::Arc;

use turnloom_core::{Tool, ToolError, ToolLibrary};

/// The default tool library with all built-in tools registered.
pub fn default_tool_library() -> ToolLibrary {
    let mut library = ToolLibrary::new();
    library.register(Arc::new(GetWeatherTool));
    library.register(Arc::new(CalculatorTool));
    library
}

/// Weather lookup stub returning deterministic mock data per city.
pub struct GetWeatherTool;

#[async_trait]
impl Tool for GetWeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Look up current weather conditions for a city. Returns temperature, conditions, and humidity."
    }

    async fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let city = arguments
            .get("city")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'city' argument".into()))?;

        // Deterministic but varied per city name
        let hash: u32 = city
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));

        let conditions = ["clear", "partly cloudy", "overcast", "light rain", "windy"];
        let condition = conditions[(hash % conditions.len() as u32) as usize];
        let temperature_c = -5 + (hash % 35) as i32;
        let humidity = 30 + (hash % 60);

        Ok(serde_json::json!({
            "city": city,
            "temperature_c": temperature_c,
            "conditions": condition,
            "humidity_pct": humidity,
        }))
    }
}

/// Arithmetic evaluator: `+ - * /`, parentheses, unary minus, decimals.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a mathematical expression. Supports +, -, *, /, parentheses, and decimal numbers."
    }

    async fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let expression = arguments
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'expression' argument".into()))?;

        let value = Parser::new(expression).parse().map_err(|e| {
            ToolError::ExecutionFailed {
                tool_name: "calculator".into(),
                reason: e,
            }
        })?;

        Ok(serde_json::json!({ "expression": expression, "result": value }))
    }
}

/// Recursive-descent expression parser.
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<f64, String> {
        let value = self.expr()?;
        self.skip_ws();
        if self.pos < self.input.len() {
            return Err(format!("unexpected input at position {}", self.pos));
        }
        Ok(value)
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut acc = self.term()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    acc += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    acc -= self.term()?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut acc = self.factor()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    acc *= self.factor()?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err("division by zero".into());
                    }
                    acc /= divisor;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn factor(&mut self) -> Result<f64, String> {
        self.skip_ws();
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                self.skip_ws();
                if self.peek() != Some(b')') {
                    return Err("expected closing parenthesis".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) => Err(format!("unexpected character '{}'", c as char)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| "invalid number".to_string())
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }
}
