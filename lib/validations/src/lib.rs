//! # Input Validation Module
//!
//! This module provides validation functions for user inputs to prevent
//! invalid data from entering the system and improve security.

use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use regex::Regex;

/// Options to validate input strings to have certain properties.
/// This ensures only valid data can enter the system.
///
/// ## Usage
///
/// ```
/// use validations::{StringValidator, StringValidatorMatches};
/// StringValidator::default()
///   .min_length(1)
///   .max_length(100)
///   .matches(StringValidatorMatches::EnvironmentName)
///   .validate("dev")
///   .unwrap();
/// ```
#[derive(Default)]
pub struct StringValidator {
  /// Specify the minimum length of string.
  /// Setting `0` will effectively skip this validation.
  pub min_length: usize,
  /// Specify max length of string, or None to allow arbitrary length.
  pub max_length: Option<usize>,
  /// Skip the control character check.
  /// Most values should not contain these by default.
  pub skip_control_check: bool,
  /// Specify a pattern to validate the string contents.
  pub matches: Option<StringValidatorMatches>,
}

impl StringValidator {
  /// Returns Ok if input passes validations, otherwise includes
  /// error with failure reason.
  pub fn validate(&self, input: &str) -> anyhow::Result<()> {
    let len = input.len();

    if len < self.min_length {
      return Err(anyhow!(
        "Input too short. Must be at least {} characters.",
        self.min_length
      ));
    }

    if let Some(max_length) = self.max_length
      && len > max_length
    {
      return Err(anyhow!(
        "Input too long. Must be at most {max_length} characters."
      ));
    }

    if !self.skip_control_check {
      validate_no_control_chars(input)?;
    }

    if let Some(matches) = &self.matches {
      matches.validate(input)?
    }

    Ok(())
  }

  pub fn min_length(mut self, min_length: usize) -> StringValidator {
    self.min_length = min_length;
    self
  }

  pub fn max_length(
    mut self,
    max_length: impl Into<Option<usize>>,
  ) -> StringValidator {
    self.max_length = max_length.into();
    self
  }

  pub fn skip_control_check(mut self) -> StringValidator {
    self.skip_control_check = true;
    self
  }

  pub fn matches(
    mut self,
    matches: impl Into<Option<StringValidatorMatches>>,
  ) -> StringValidator {
    self.matches = matches.into();
    self
  }
}

pub enum StringValidatorMatches {
  /// Environment / project names:
  /// lowercase letters, digits, hyphens, 1-63 chars,
  /// no leading or trailing hyphen.
  EnvironmentName,
  /// A compose / shared service name as it appears
  /// in the user's compose document.
  ServiceName,
  /// http or https URL.
  HttpUrl,
  /// A DNS suffix override, eg `.test` or `.dev.local`.
  DnsSuffix,
}

impl StringValidatorMatches {
  /// Returns Ok if input passes validations, otherwise includes
  /// error with failure reason.
  fn validate(&self, input: &str) -> anyhow::Result<()> {
    let validate = || match self {
      StringValidatorMatches::EnvironmentName => {
        static ENV_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = ENV_NAME_REGEX.get_or_init(|| {
          Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$")
            .expect("Failed to initialize environment name regex")
        });
        if regex.is_match(input) {
          Ok(())
        } else {
          Err(anyhow!(
            "Only lowercase letters, digits and hyphens are allowed, and the name may not start or end with a hyphen"
          ))
        }
      }

      StringValidatorMatches::ServiceName => {
        static SERVICE_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = SERVICE_NAME_REGEX.get_or_init(|| {
          Regex::new(r"^[a-zA-Z0-9._-]+$")
            .expect("Failed to initialize service name regex")
        });
        if regex.is_match(input) {
          Ok(())
        } else {
          Err(anyhow!(
            "Only alphanumeric characters, dots, underscores and hyphens are allowed"
          ))
        }
      }

      StringValidatorMatches::HttpUrl => {
        if !input.starts_with("http://")
          && !input.starts_with("https://")
        {
          return Err(anyhow!(
            "Input must start with http:// or https://"
          ));
        }
        url::Url::parse(input)
          .context("Failed to parse input as URL")
          .map(|_| ())
      }

      StringValidatorMatches::DnsSuffix => {
        if !input.starts_with('.') {
          return Err(anyhow!("DNS suffix must start with '.'"));
        }
        static SUFFIX_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = SUFFIX_REGEX.get_or_init(|| {
          Regex::new(r"^\.[a-z0-9]([a-z0-9.-]*[a-z0-9])?$")
            .expect("Failed to initialize dns suffix regex")
        });
        if regex.is_match(input) {
          Ok(())
        } else {
          Err(anyhow!("Invalid DNS suffix"))
        }
      }
    };
    validate().context("Invalid characters in input")
  }
}

/// Validates an environment name per the core invariant: lowercase
/// letters, digits, hyphens; 1-63 chars; no leading/trailing hyphen.
pub fn validate_environment_name(name: &str) -> anyhow::Result<()> {
  StringValidator::default()
    .min_length(1)
    .max_length(63)
    .matches(StringValidatorMatches::EnvironmentName)
    .validate(name)
    .with_context(|| format!("Invalid environment name '{name}'"))
}

fn validate_no_control_chars(input: &str) -> anyhow::Result<()> {
  for (index, char) in input.chars().enumerate() {
    if char.is_control() {
      return Err(anyhow!(
        "Control character at index {index}. Input: \"{input}\""
      ));
    }
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn accepts_valid_names() {
    for name in ["a", "dev", "dev-2", "a".repeat(63).as_str()] {
      assert!(
        validate_environment_name(name).is_ok(),
        "expected '{name}' to be valid"
      );
    }
  }

  #[test]
  fn rejects_invalid_names() {
    for name in [
      "",
      "a".repeat(64).as_str(),
      "-dev",
      "dev-",
      "Dev",
      "dev_env",
    ] {
      assert!(
        validate_environment_name(name).is_err(),
        "expected '{name}' to be invalid"
      );
    }
  }
}
