//! Container service behind a load balancer.
//!
//! Builds an image into a private registry and runs it as a Fargate service
//! in the default VPC. The stack exports the public `url`.

use serde_json::{Value, json};

use crate::config::REGION_KEY;
use crate::context::DeploymentContext;
use crate::error::Result;
use crate::output::Output;
use crate::resource::{Input, Inputs, ResourceOptions};

/// Program name in the project file.
pub const NAME: &str = "fargate";

/// Required config value passed to the container as `APP_MESSAGE`.
pub const APP_MESSAGE_KEY: &str = "appMessage";

/// Region used when neither the config nor the project sets one.
pub const DEFAULT_REGION: &str = "us-west-2";

const CONTAINER_NAME: &str = "app-container";
const CONTAINER_PORT: u16 = 8080;
const EXECUTION_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

/// Declares the stack.
pub fn declare(ctx: &mut DeploymentContext) -> Result<()> {
    let message = ctx.config().require(APP_MESSAGE_KEY)?;
    let region = ctx.config().get_or(REGION_KEY, DEFAULT_REGION);

    let repo = ctx.declare("aws:ecr/Repository", "apprepo", Inputs::new(), ResourceOptions::new())?;
    let repository_url = repo.output("repositoryUrl")?.string();
    let server = repository_url.try_apply(|url| {
        url.split_once('/')
            .map(|(server, _)| server.to_string())
            .ok_or_else(|| format!("repository url '{url}' has no path"))
    });

    let auth = ctx.declare(
        "aws:ecr/getAuthorizationToken",
        "ecr-auth",
        Inputs::new().set("registryId", repo.output("registryId")?),
        ResourceOptions::new(),
    )?;

    let image = ctx.declare(
        "docker:Image",
        "myappimage",
        Inputs::new()
            .set("imageName", &repository_url)
            .set("build", json!({ "context": "." }))
            .set(
                "registry",
                Input::object([
                    ("server", Input::from(server)),
                    ("username", Input::from(auth.output("userName")?)),
                    ("password", Input::from(auth.output("password")?)),
                ]),
            ),
        ResourceOptions::new(),
    )?;

    let vpc = ctx.declare(
        "aws:ec2/getVpc",
        "default-vpc",
        Inputs::new().set("default", true),
        ResourceOptions::new(),
    )?;
    let vpc_id = vpc.output("id")?;
    let subnets = ctx.declare(
        "aws:ec2/getSubnetIds",
        "default-subnets",
        Inputs::new().set("vpcId", &vpc_id),
        ResourceOptions::new(),
    )?;
    let subnet_ids = subnets.output("ids")?;

    let sg = ctx.declare(
        "aws:ec2/SecurityGroup",
        "app-sg",
        Inputs::new()
            .set("vpcId", &vpc_id)
            .set("description", "Allow HTTP")
            .set(
                "ingress",
                json!([{ "protocol": "tcp", "fromPort": 80, "toPort": 80, "cidrBlocks": ["0.0.0.0/0"] }]),
            )
            .set(
                "egress",
                json!([{ "protocol": "-1", "fromPort": 0, "toPort": 0, "cidrBlocks": ["0.0.0.0/0"] }]),
            ),
        ResourceOptions::new(),
    )?;
    let sg_id = sg.id()?;

    let cluster = ctx.declare("aws:ecs/Cluster", "app-cluster", Inputs::new(), ResourceOptions::new())?;

    let assume_role_policy = json!({
        "Version": "2008-10-17",
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            "Effect": "Allow",
            "Sid": ""
        }]
    });
    let role = ctx.declare(
        "aws:iam/Role",
        "task-execution-role",
        Inputs::new().set("assumeRolePolicy", assume_role_policy.to_string()),
        ResourceOptions::new(),
    )?;

    let log_group = ctx.declare(
        "aws:cloudwatch/LogGroup",
        "app-log-group",
        Inputs::new(),
        ResourceOptions::new(),
    )?;

    let settings = json!({ "message": message, "region": region });
    let container_definitions = image
        .output("imageName")?
        .zip(&log_group.output("name")?)
        .apply(move |(image_name, group): (Value, Value)| {
            json!([{
                "name": CONTAINER_NAME,
                "image": image_name,
                "essential": true,
                "portMappings": [{
                    "containerPort": CONTAINER_PORT,
                    "hostPort": CONTAINER_PORT,
                    "protocol": "tcp"
                }],
                "environment": [{ "name": "APP_MESSAGE", "value": message }],
                "logConfiguration": {
                    "logDriver": "awslogs",
                    "options": {
                        "awslogs-group": group,
                        "awslogs-region": region,
                        "awslogs-stream-prefix": "ecs"
                    }
                }
            }])
            .to_string()
        })
        .keyed(settings);

    let task = ctx.declare(
        "aws:ecs/TaskDefinition",
        "app-task",
        Inputs::new()
            .set("family", "app-task")
            .set("cpu", "256")
            .set("memory", "512")
            .set("networkMode", "awsvpc")
            .set("requiresCompatibilities", json!(["FARGATE"]))
            .set("executionRoleArn", role.output("arn")?)
            .set("containerDefinitions", container_definitions),
        ResourceOptions::new(),
    )?;

    ctx.declare(
        "aws:iam/RolePolicyAttachment",
        "task-exec-policy",
        Inputs::new()
            .set("role", role.output("name")?)
            .set("policyArn", EXECUTION_POLICY_ARN),
        ResourceOptions::new(),
    )?;

    let lb = ctx.declare(
        "aws:lb/LoadBalancer",
        "app-lb",
        Inputs::new()
            .set("loadBalancerType", "application")
            .set("securityGroups", Input::array([&sg_id]))
            .set("subnets", &subnet_ids),
        ResourceOptions::new(),
    )?;

    let target_group = ctx.declare(
        "aws:lb/TargetGroup",
        "app-tg",
        Inputs::new()
            .set("port", json!(80))
            .set("protocol", "HTTP")
            .set("targetType", "ip")
            .set("vpcId", &vpc_id)
            .set(
                "healthCheck",
                json!({
                    "path": "/",
                    "port": CONTAINER_PORT.to_string(),
                    "protocol": "HTTP",
                    "matcher": "200",
                    "interval": 30,
                    "timeout": 5,
                    "healthyThreshold": 2,
                    "unhealthyThreshold": 2
                }),
            ),
        ResourceOptions::new(),
    )?;
    let target_group_arn = target_group.output("arn")?;

    let listener = ctx.declare(
        "aws:lb/Listener",
        "app-listener",
        Inputs::new()
            .set("loadBalancerArn", lb.output("arn")?)
            .set("port", json!(80))
            .set(
                "defaultActions",
                Input::array([Input::object([
                    ("type", Input::from("forward")),
                    ("targetGroupArn", Input::from(&target_group_arn)),
                ])]),
            ),
        ResourceOptions::new(),
    )?;

    ctx.declare(
        "aws:ecs/Service",
        "app-service",
        Inputs::new()
            .set("cluster", cluster.output("arn")?)
            .set("desiredCount", json!(1))
            .set("launchType", "FARGATE")
            .set("taskDefinition", task.output("arn")?)
            .set(
                "networkConfiguration",
                Input::object([
                    ("assignPublicIp", Input::from(true)),
                    ("subnets", Input::from(&subnet_ids)),
                    ("securityGroups", Input::array([&sg_id])),
                ]),
            )
            .set(
                "loadBalancers",
                Input::array([Input::object([
                    ("targetGroupArn", Input::from(&target_group_arn)),
                    ("containerName", Input::from(CONTAINER_NAME)),
                    ("containerPort", Input::from(CONTAINER_PORT)),
                ])]),
            ),
        ResourceOptions::new().depends_on(listener.name()),
    )?;

    let url: Output<String> = lb
        .output("dnsName")?
        .string()
        .apply(|dns_name| format!("http://{dns_name}"));
    ctx.export("url", &url);
    Ok(())
}
