use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LaunchErrorKind {
    TypeMismatch,
    ShapeMismatch,
    ArgsNotSupport,
    /// 同步发射阶段失败。
    ExecutionFailed,
    /// 发射后轮询到的设备错误，或流拒绝了回调注册。
    DeviceFailure,
    /// 同步执行入口。
    Unimplemented,
}

#[derive(Clone, Debug)]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub info: String,
}

impl fmt::Display for LaunchError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

impl Error for LaunchError {}

/// 驱动报告的原始错误。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DeviceError {
    pub name: String,
    pub description: String,
}

impl DeviceError {
    #[inline]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for DeviceError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "device error {}: {}", self.name, self.description)
    }
}

impl Error for DeviceError {}

impl From<DeviceError> for LaunchError {
    #[inline]
    fn from(e: DeviceError) -> Self {
        functions::device_failure(e.to_string())
    }
}

pub(super) mod functions {
    use super::{LaunchError, LaunchErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(LaunchError: type_mismatch       TypeMismatch   );
    builder!(LaunchError: shape_mismatch      ShapeMismatch  );
    builder!(LaunchError: args_not_support    ArgsNotSupport );

    builder!(LaunchError: execution_failed    ExecutionFailed);
    builder!(LaunchError: device_failure      DeviceFailure  );
    builder!(LaunchError: unimplemented       Unimplemented  );
}

#[test]
fn test_device_error_message() {
    let e = LaunchError::from(DeviceError::new(
        "IllegalAddress",
        "an illegal memory access was encountered",
    ));
    assert_eq!(e.kind, LaunchErrorKind::DeviceFailure);
    assert!(e.info.contains("IllegalAddress"));
    assert!(e.info.contains("an illegal memory access was encountered"));
}
