use spark_socket::{SocketError, codes};
use std::io;

/// 描述一次底层操作对应的默认错误码与文案前缀。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: codes::LISTEN_FAILED,
    message: "tcp bind",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: codes::LISTEN_FAILED,
    message: "tcp listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: codes::ACCEPT_FAILED,
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: codes::CONNECT_FAILED,
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: codes::RECEIVE_FAILED,
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::SEND_FAILED,
    message: "tcp write",
};

/// 将 IO 错误映射为 [`SocketError`]。
///
/// 可明确归因的错误种类（拒绝、占用、重置）使用专属错误码，其余沿用操作的默认码。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> SocketError {
    SocketError::new(
        classify(kind, &error),
        format!("{}: {}", kind.message, error),
    )
}

fn classify(kind: OperationKind, error: &io::Error) -> &'static str {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionRefused => codes::CONNECTION_REFUSED,
        ErrorKind::AddrInUse => codes::ADDRESS_IN_USE,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            codes::CONNECTION_RESET
        }
        _ => kind.code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_kinds_override_operation_code() {
        let refused = map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.code(), codes::CONNECTION_REFUSED);
        assert!(refused.message().starts_with("tcp connect: "));

        let in_use = map_io_error(BIND, io::Error::from(io::ErrorKind::AddrInUse));
        assert_eq!(in_use.code(), codes::ADDRESS_IN_USE);

        let reset = map_io_error(WRITE, io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(reset.code(), codes::CONNECTION_RESET);
    }

    #[test]
    fn unclassified_kinds_keep_operation_code() {
        let other = map_io_error(READ, io::Error::other("boom"));
        assert_eq!(other.code(), codes::RECEIVE_FAILED);
        let accept = map_io_error(ACCEPT, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(accept.code(), codes::ACCEPT_FAILED);
    }
}
