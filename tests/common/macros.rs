/// Unwraps an `Ok`, panicking with the error's debug form otherwise.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!("Expected Ok(_), got Err({:?})", err),
        }
    };
}

/// Asserts an `Err` whose value matches the given pattern.
#[macro_export]
macro_rules! assert_err_matches {
    ($expr:expr, $pat:pat) => {
        match $expr {
            Ok(_) => panic!("Expected Err({}), got Ok(_)", stringify!($pat)),
            Err(err) => assert!(
                matches!(err, $pat),
                "Expected Err({}), got Err({:?})",
                stringify!($pat),
                err
            ),
        }
    };
}
