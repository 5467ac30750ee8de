//! Property-based tests for gate classification.

use proptest::prelude::*;
use kg_core::intercept::classify::TRANSPORT_COMMANDS;
use kg_core::intercept::{classify, split_invocation, GateReason, SigningDefaults};

fn defaults() -> impl Strategy<Value = SigningDefaults> {
    (any::<bool>(), any::<bool>()).prop_map(|(commit_gpgsign, tag_gpgsign)| SigningDefaults {
        commit_gpgsign,
        tag_gpgsign,
    })
}

/// Positional arguments only; none of them can be mistaken for an option.
fn words() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9./]{1,12}", 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Transport commands gate whatever follows them.
    #[test]
    fn transport_always_gates(
        idx in 0..TRANSPORT_COMMANDS.len(),
        args in prop::collection::vec("[a-zA-Z0-9=_./-]{0,12}", 0..6),
        defaults in defaults(),
    ) {
        let decision = classify(TRANSPORT_COMMANDS[idx], &args, defaults);
        prop_assert!(decision.required);
        prop_assert_eq!(decision.reason, GateReason::Push);
    }

    /// Operations outside transport, commit and tag never gate.
    #[test]
    fn other_operations_never_gate(
        name in "[a-z]{2,10}",
        args in prop::collection::vec("[a-zA-Z0-9=_./-]{0,12}", 0..6),
        defaults in defaults(),
    ) {
        prop_assume!(!TRANSPORT_COMMANDS.contains(&name.as_str()));
        prop_assume!(name != "commit" && name != "tag");
        let decision = classify(&name, &args, defaults);
        prop_assert!(!decision.required);
        prop_assert_eq!(decision.reason, GateReason::None);
    }

    /// The last signing flag on a commit line beats config and earlier flags.
    #[test]
    fn last_commit_flag_wins(
        mut args in words(),
        earlier in prop::sample::select(vec!["-S", "--gpg-sign", "--no-gpg-sign"]),
        sign_last in any::<bool>(),
        defaults in defaults(),
    ) {
        args.insert(0, earlier.to_string());
        args.push(if sign_last { "-S".into() } else { "--no-gpg-sign".into() });
        let decision = classify("commit", &args, defaults);
        prop_assert_eq!(decision.required, sign_last);
        if sign_last {
            prop_assert_eq!(decision.reason, GateReason::SigningCommit);
        }
    }

    /// Without an explicit flag a commit follows `commit.gpgsign`.
    #[test]
    fn unflagged_commit_follows_config(args in words(), defaults in defaults()) {
        let decision = classify("commit", &args, defaults);
        prop_assert_eq!(decision.required, defaults.commit_gpgsign);
    }

    /// Listing tags never signs, whatever the config says.
    #[test]
    fn tag_listing_never_gates(args in words(), tag_gpgsign in any::<bool>()) {
        let mut argv = vec!["-l".to_string()];
        argv.extend(args);
        let defaults = SigningDefaults { commit_gpgsign: false, tag_gpgsign };
        prop_assert!(!classify("tag", &argv, defaults).required);
    }

    /// Global options before the subcommand do not change the decision.
    #[test]
    fn global_options_are_transparent(
        dir in "/[a-z]{1,8}",
        name in prop::sample::select(vec!["push", "fetch", "status", "log", "commit", "tag"]),
        args in words(),
        defaults in defaults(),
    ) {
        let mut bare = vec![name.to_string()];
        bare.extend(args.iter().cloned());
        let mut prefixed = vec!["-C".to_string(), dir, "--no-pager".to_string()];
        prefixed.extend(bare.iter().cloned());

        let plain = split_invocation(&bare);
        let with_globals = split_invocation(&prefixed);
        prop_assert_eq!(&plain.name, &with_globals.name);
        prop_assert_eq!(&plain.args, &with_globals.args);
        prop_assert_eq!(with_globals.globals.len(), 3);

        let name = with_globals.name.unwrap_or_default();
        prop_assert_eq!(
            classify(&name, &plain.args, defaults),
            classify(&name, &with_globals.args, defaults)
        );
    }
}
