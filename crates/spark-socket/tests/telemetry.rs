//! 订阅器安装入口需要独占进程级全局状态，因此单独成为一个测试二进制。

use spark_socket::telemetry::{self, TelemetryError};

#[test]
fn install_succeeds_once_then_rejects_repeats() {
    telemetry::install().expect("全新进程中首次安装应成功");
    assert!(
        matches!(telemetry::install(), Err(TelemetryError::AlreadyInstalled)),
        "重复安装必须返回 AlreadyInstalled"
    );
}
