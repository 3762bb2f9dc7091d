//! 统一错误类型与对外状态码.
//!
//! 解析引擎内部全部使用 `BsResult` 传播错误, 只有在控制接口边界
//! (`parse_next_au` / `sync`) 才折算为 `Status`.

use thiserror::Error;

/// 码流解析统一错误类型
#[derive(Debug, Error)]
pub enum BsError {
    /// 缓冲区耗尽, 需要回填后重试
    #[error("缓冲区已耗尽")]
    EndOfBuffer,

    /// 码流语法错误
    #[error("语法错误: {0}")]
    InvalidSyntax(String),

    /// 引用了尚未出现的参数集
    #[error("参数集未激活: {0}")]
    NoActiveSet(String),

    /// 内存分配失败
    #[error("内存分配失败: {0}")]
    AllocFailure(String),

    /// 目标缓冲区不足
    #[error("目标缓冲区不足: 需要 {needed} 字节, 实际 {available} 字节")]
    NotEnoughBuffer { needed: usize, available: usize },

    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 功能未实现
    #[error("功能未实现: {0}")]
    NotImplemented(String),

    /// 句柄无效或已释放
    #[error("无效句柄")]
    BadHandle,

    /// NAL 单元顺序错误
    #[error("单元顺序错误: {0}")]
    WrongUnitOrder(String),

    /// 数据不完整
    #[error("数据不完整: {0}")]
    IncompleteData(String),

    /// 任务调度错误 (队列溢出, 依赖丢失)
    #[error("任务调度错误: {0}")]
    Scheduling(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 码流解析统一 Result 类型
pub type BsResult<T> = Result<T, BsError>;

impl BsError {
    /// 是否为可通过回填数据恢复的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EndOfBuffer)
    }

    /// 构造语法错误的便捷函数
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::InvalidSyntax(msg.into())
    }
}

/// 控制接口返回的状态码
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    None = 0,
    Unknown = -1,
    WrongUnitOrder = -2,
    MoreDataNeeded = -3,
    InvalidParams = -4,
    AllocFailure = -5,
    NotImplemented = -6,
    NotEnoughBuffer = -7,
    BadHandle = -8,
    IncompleteData = -9,
}

impl Status {
    /// 是否表示成功
    pub fn is_ok(self) -> bool {
        self == Self::None
    }

    /// 状态名称
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Unknown => "unknown",
            Self::WrongUnitOrder => "wrong-unit-order",
            Self::MoreDataNeeded => "more-data-needed",
            Self::InvalidParams => "invalid-params",
            Self::AllocFailure => "alloc-failure",
            Self::NotImplemented => "not-implemented",
            Self::NotEnoughBuffer => "not-enough-buffer",
            Self::BadHandle => "bad-handle",
            Self::IncompleteData => "incomplete-data",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&BsError> for Status {
    fn from(err: &BsError) -> Self {
        match err {
            BsError::EndOfBuffer => Self::MoreDataNeeded,
            BsError::InvalidSyntax(_) => Self::IncompleteData,
            BsError::NoActiveSet(_) => Self::WrongUnitOrder,
            BsError::AllocFailure(_) => Self::AllocFailure,
            BsError::NotEnoughBuffer { .. } => Self::NotEnoughBuffer,
            BsError::InvalidArgument(_) => Self::InvalidParams,
            BsError::NotImplemented(_) => Self::NotImplemented,
            BsError::BadHandle => Self::BadHandle,
            BsError::WrongUnitOrder(_) => Self::WrongUnitOrder,
            BsError::IncompleteData(_) => Self::IncompleteData,
            BsError::Scheduling(_) | BsError::Io(_) | BsError::Internal(_) => Self::Unknown,
        }
    }
}

impl<T> From<&BsResult<T>> for Status {
    fn from(res: &BsResult<T>) -> Self {
        match res {
            Ok(_) => Self::None,
            Err(err) => Self::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Status::from(&BsError::EndOfBuffer), Status::MoreDataNeeded);
        assert_eq!(
            Status::from(&BsError::NoActiveSet("pps 3".into())),
            Status::WrongUnitOrder
        );
        assert_eq!(
            Status::from(&BsError::NotEnoughBuffer {
                needed: 10,
                available: 4
            }),
            Status::NotEnoughBuffer
        );
        assert_eq!(Status::from(&BsError::BadHandle), Status::BadHandle);
        let ok: BsResult<u32> = Ok(1);
        assert_eq!(Status::from(&ok), Status::None);
    }

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::None as i32, 0);
        assert_eq!(Status::IncompleteData as i32, -9);
        assert_eq!(Status::MoreDataNeeded.to_string(), "more-data-needed");
    }
}
