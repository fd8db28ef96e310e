use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("policy parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("expression error: {0}")]
    Expr(#[from] crate::expr::ExprError),

    #[error("invalid literal: {0}")]
    InvalidLiteral(String),

    #[error("unsupported schema version {0}")]
    UnsupportedSchemaVersion(u32),
}

pub type Result<T> = std::result::Result<T, ModelError>;
