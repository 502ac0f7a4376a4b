//! Generated gRPC bindings for the plugin surfaces the driver serves: the
//! kubelet plugin registration service, the DRA node plugin service and the
//! container runtime event contract.

pub mod registration {
    pub mod v1 {
        #![allow(clippy::all)]
        tonic::include_proto!("pluginregistration");

        /// Version of the plugin registration API this driver implements.
        pub const API_VERSION: &str = "v1";
    }
}

pub mod dra {
    pub mod v1beta1 {
        #![allow(clippy::all)]
        tonic::include_proto!("dra.v1beta1");

        /// Version of the DRA plugin API this driver implements.
        pub const API_VERSION: &str = "v1beta1";
    }
}

pub mod runtime {
    pub mod v1 {
        #![allow(clippy::all)]
        tonic::include_proto!("runtime.v1");
    }
}
