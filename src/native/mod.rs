/// Native module runs task programs as plain child processes, enforcing
/// limits with process groups, rlimits and `/proc` sampling instead of
/// containers.
pub mod process;
