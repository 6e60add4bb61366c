//! Generated protobuf/tonic bindings for the interceptor service, built
//! ahead-of-time from `proto/interceptor.proto` by `build.rs` - the
//! "ahead-of-time code generation from the protocol description" the
//! REDESIGN FLAGS call for, in place of any install-time stub generation.

tonic::include_proto!("channel_isolator.interceptor.v1");
