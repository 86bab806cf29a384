tonic::include_proto!("jobforge.v1");
