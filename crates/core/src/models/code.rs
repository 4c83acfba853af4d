use serde::{Deserialize, Serialize};

/// 执行结果代码
///
/// Run 的 `status`、Item 和 TaskRun 的 `code` 共用这一组取值。
/// `Pending` 之后只能单向转换为 `Ok` 或 `Err`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Code {
    #[default]
    Pending,
    Ok,
    Err,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Pending => "pending",
            Code::Ok => "ok",
            Code::Err => "err",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Code::Pending),
            "ok" => Some(Code::Ok),
            "err" => Some(Code::Err),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Code::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// 由是否成功得到终态代码
    pub fn from_success(success: bool) -> Self {
        if success {
            Code::Ok
        } else {
            Code::Err
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Postgres> for Code {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Code {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Code::parse(s).ok_or_else(|| format!("Invalid code: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for Code {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}
