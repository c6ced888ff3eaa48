pub mod nginx_ingress_controller;
