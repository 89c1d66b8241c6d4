//! Primitives for loading typed and untyped configuration data.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path, sync::Arc};

use basenji_error::GenericError;
use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
pub use figment::value;
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        ///
        /// Includes the environment variable spellings of the field when environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field did not have the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&HashSet::new(), e)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct EnvironmentPrefix(String);

impl EnvironmentPrefix {
    /// Returns the environment variable that `key` would be read from.
    ///
    /// The prefix is already uppercased with a trailing underscore.
    fn transform_key(&self, key: &str) -> String {
        format!("{}{}", self.0, key.replace('.', "_").to_uppercase())
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<value::Map<figment::Profile, value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// Sources have an implicit priority based on the order in which they are added: sources added later take precedence
/// over sources added earlier. Once all sources are added, the configuration can either be deserialized directly
/// ([`into_typed`][Self::into_typed]) or wrapped for querying by key ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: HashSet<EnvironmentPrefix>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error will be returned.
    pub fn from_yaml<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::from_yaml(&path)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    pub fn try_from_yaml<P: AsRef<Path>>(mut self, path: P) -> Self {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => debug!(
                error = %e,
                file_path = %path.as_ref().display(),
                "Unable to read YAML configuration file. Ignoring."
            ),
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid JSON, an error will be returned.
    pub fn from_json<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::from_json(&path)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads configuration from environment variables.
    ///
    /// An underscore is appended to the prefix if it doesn't already end with one, so a prefix of `basenji` matches
    /// every environment variable starting with `BASENJI_`. The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is not `Send`/`Sync`, so we snapshot the matching variables instead of holding onto the provider.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(dict.clone()))));
            self.env_prefixes.insert(EnvironmentPrefix(prefix));
        }
        Ok(self)
    }

    fn into_figment(self) -> (Figment, HashSet<EnvironmentPrefix>) {
        let figment = self
            .providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));
        (figment, self.env_prefixes)
    }

    /// Consumes the loader, deserializing the configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let (figment, env_prefixes) = self.into_figment();
        figment.extract().map_err(|e| from_figment_error(&env_prefixes, e))
    }

    /// Consumes the loader and wraps the configuration in a generic wrapper.
    pub fn into_generic(self) -> GenericConfiguration {
        let (figment, env_prefixes) = self.into_figment();
        GenericConfiguration {
            inner: Arc::new(Inner { figment, env_prefixes }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: HashSet<EnvironmentPrefix>,
}

/// A generic configuration object.
///
/// This is the merged configuration derived from [`ConfigurationLoader`]. Values can be queried by key, where keys are
/// in the form of `a.b.c` and periods indicate a nested value, or the whole configuration can be deserialized at once.
///
/// `GenericConfiguration` is cheaply cloneable.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => {
                // Environment variables can't express nesting, so `a.b` may only exist as `a_b`.
                let fallback_key = key.replace('.', "_");
                self.inner
                    .figment
                    .extract_inner(&fallback_key)
                    .map_err(|e| from_figment_error(&self.inner.env_prefixes, e))
            }
            Err(e) => Err(from_figment_error(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// ## Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value of `T` if the key does not exist or could not be
    /// deserialized.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// ## Errors
    ///
    /// If the key exists but the value could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.env_prefixes, e))
    }
}

fn from_figment_error(env_prefixes: &HashSet<EnvironmentPrefix>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = env_prefixes
                .iter()
                .map(|prefix| prefix.transform_key(&field))
                .collect::<Vec<_>>();
            valid_keys.sort();
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));
            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
