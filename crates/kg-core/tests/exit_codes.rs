//! Exit code contract tests for keygate.

use kg_common::Error;
use kg_core::exit_codes::ExitCode;

mod exit_code_values {
    use super::*;

    #[test]
    fn operational_codes() {
        assert_eq!(ExitCode::Clean.as_i32(), 0);
        assert_eq!(ExitCode::Locked.as_i32(), 1);
        assert_eq!(ExitCode::Interrupted.as_i32(), 6);
    }

    #[test]
    fn user_error_codes_are_10_to_19() {
        assert_eq!(ExitCode::ArgsError.as_i32(), 10);
        assert_eq!(ExitCode::ConfigError.as_i32(), 11);
        assert_eq!(ExitCode::SigningError.as_i32(), 12);
        assert_eq!(ExitCode::SessionError.as_i32(), 13);
        assert_eq!(ExitCode::LockError.as_i32(), 14);
        assert_eq!(ExitCode::EndpointError.as_i32(), 15);
        assert_eq!(ExitCode::SpawnError.as_i32(), 16);
    }

    #[test]
    fn internal_error_codes_are_20_plus() {
        assert_eq!(ExitCode::InternalError.as_i32(), 20);
        assert_eq!(ExitCode::IoError.as_i32(), 21);
        assert_eq!(ExitCode::TimeoutError.as_i32(), 22);
    }

    #[test]
    fn classification_helpers() {
        assert!(ExitCode::Clean.is_success());
        assert!(ExitCode::Locked.is_operational());
        assert!(!ExitCode::Locked.is_error());
        assert!(ExitCode::SigningError.is_user_error());
        assert!(ExitCode::TimeoutError.is_error());
        assert!(!ExitCode::TimeoutError.is_user_error());
    }
}

mod error_mapping {
    use super::*;

    fn code(err: Error) -> ExitCode {
        ExitCode::from(&err)
    }

    #[test]
    fn gate_failures_have_distinct_codes() {
        assert_eq!(code(Error::UnlockTimeout { seconds: 60 }), ExitCode::TimeoutError);
        assert_eq!(code(Error::NoSession("x".into())), ExitCode::SessionError);
        assert_eq!(
            code(Error::SigningMisconfigured("x".into())),
            ExitCode::SigningError
        );
        assert_eq!(
            code(Error::EndpointUnreachable("x".into())),
            ExitCode::EndpointError
        );
        assert_eq!(code(Error::Interrupted), ExitCode::Interrupted);
    }

    #[test]
    fn gate_failures_never_collide_with_success() {
        let errors = [
            Error::UnlockTimeout { seconds: 1 },
            Error::NoSession("x".into()),
            Error::VaultLocked("/s".into()),
            Error::SigningMisconfigured("x".into()),
            Error::ProcessSpawnFailure("x".into()),
            Error::Config("x".into()),
        ];
        for err in errors {
            assert_ne!(ExitCode::from(&err).as_i32(), 0, "{err}");
        }
    }

    #[test]
    fn code_names_are_stable() {
        assert_eq!(ExitCode::TimeoutError.code_name(), "ERR_TIMEOUT");
        assert_eq!(ExitCode::Locked.to_string(), "OK_LOCKED (1)");
    }
}
